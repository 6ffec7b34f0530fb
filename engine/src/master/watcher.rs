//! Master account poller.
//!
//! Reads the master's trading state on a fixed cadence and hands each
//! successful read to the control loop as a `MasterSnapshot`. A failed read
//! emits nothing for that tick: the engine keeps its shadow state and no
//! close is ever derived from terminal unavailability.

use std::sync::atomic::Ordering;
use std::time::Duration;

use broker::session::BrokerSession;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use common::time::now_ms;

use crate::master::snapshot::MasterSnapshot;
use crate::metrics::counters::Counters;

pub struct MasterWatcher {
    session: BrokerSession,
    poll_every: Duration,
    out: mpsc::Sender<MasterSnapshot>,
    counters: Counters,
}

impl MasterWatcher {
    pub fn new(
        session: BrokerSession,
        poll_every: Duration,
        out: mpsc::Sender<MasterSnapshot>,
        counters: Counters,
    ) -> Self {
        Self {
            session,
            poll_every,
            out,
            counters,
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.poll_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Set while the master feed is failing, so the degradation is
        // reported once per continuous outage rather than every tick.
        let mut degraded = false;

        info!(
            login = self.session.login(),
            every_ms = self.poll_every.as_millis() as u64,
            "master watcher started"
        );

        loop {
            ticker.tick().await;

            match self.session.read_state().await {
                Ok(state) => {
                    if degraded {
                        info!(login = self.session.login(), "master feed recovered");
                        degraded = false;
                    }

                    let snapshot = MasterSnapshot {
                        positions: state.positions,
                        pending_orders: state.pending_orders,
                        captured_at_ms: now_ms(),
                    };

                    match self.out.try_send(snapshot) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            // Control loop still busy with the previous tick:
                            // drop, never queue.
                            self.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                            debug!("control loop busy; snapshot dropped");
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                Err(e) => {
                    self.counters
                        .master_reads_failed
                        .fetch_add(1, Ordering::Relaxed);

                    if !degraded {
                        warn!(
                            error = %e,
                            event = "engine_degraded",
                            "master read failing; holding shadow state"
                        );
                        degraded = true;
                    }
                }
            }
        }

        info!("master watcher stopped");
    }
}
