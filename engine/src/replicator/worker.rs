//! Per-follower replication worker.
//!
//! Each registered follower gets one worker task that owns the whole
//! follower state: session supervisor, position map, in-flight set, and
//! error bookkeeping. Nothing else touches that state, so no locks are
//! needed and per-follower event ordering is the channel order.
//!
//! Guarantees:
//! - Events of one tick are applied in diff order (closes, modifies, opens).
//! - At most one open/close per master ticket is in flight at any time.
//! - An open is skipped when a mapping already exists (idempotence across
//!   ticks that both observed the position as new).
//! - Every outcome produces exactly one copy-log record.
//!
//! A failing follower only marks itself; the control loop and the other
//! workers never see the failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use broker::error::BrokerError;
use broker::session::OpenRequest;
use broker::supervisor::{SessionHealth, SessionSupervisor};
use broker::types::Position;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use common::time::now_ms;

use crate::follower::Follower;
use crate::journal::{CopyLogRecord, Journal};
use crate::master::diff::CopyEvent;
use crate::metrics::counters::Counters;
use crate::notify::{Notifier, UserEvent, notify_user};
use crate::replicator::{TickJob, TickReport};
use crate::replicator::sizing::scale_volume;

pub struct FollowerWorker {
    follower: Follower,
    supervisor: SessionSupervisor,
    notifier: Arc<dyn Notifier>,
    journal: Journal,
    counters: Counters,
    notify_deadline: Duration,

    /// master ticket -> slave ticket. Injective; entries exist only while
    /// both sides are open.
    position_map: HashMap<u64, u64>,
    /// Master tickets currently mid-replication.
    pending: HashSet<u64>,
    /// Symbols this account cannot trade; logged once, then suppressed
    /// until the mapping gap is resolved by re-registration.
    unknown_symbols: HashSet<String>,
    last_error: Option<String>,
    last_tick_ok_ms: u64,
    auth_notified: bool,
}

impl FollowerWorker {
    pub fn new(
        follower: Follower,
        supervisor: SessionSupervisor,
        notifier: Arc<dyn Notifier>,
        journal: Journal,
        counters: Counters,
        notify_deadline: Duration,
    ) -> Self {
        Self {
            follower,
            supervisor,
            notifier,
            journal,
            counters,
            notify_deadline,
            position_map: HashMap::new(),
            pending: HashSet::new(),
            unknown_symbols: HashSet::new(),
            last_error: None,
            last_tick_ok_ms: 0,
            auth_notified: false,
        }
    }

    /// Worker loop. Never panics; errors are absorbed into per-follower
    /// state and the copy log.
    ///
    /// When `ready` is provided, the worker performs the registration-time
    /// connect first and reports the outcome; a failed initial connect means
    /// the follower is never activated. Respawned workers pass `None` and
    /// reconnect lazily.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<TickJob>,
        ready: Option<oneshot::Sender<Result<(), BrokerError>>>,
    ) {
        if let Some(ready) = ready {
            let outcome = self.supervisor.ensure_connected().await.map(|_| ());
            if let Err(e) = outcome.clone() {
                if e.is_fatal() {
                    self.notify_auth_failed().await;
                }
                warn!(
                    account_id = self.follower.id,
                    login = self.follower.login,
                    error = %e,
                    "initial connect failed; follower not activated"
                );
                let _ = ready.send(outcome);
                return;
            }
            let _ = ready.send(Ok(()));
        }

        info!(
            account_id = self.follower.id,
            login = self.follower.login,
            "follower worker started"
        );

        while let Some(job) = rx.recv().await {
            self.apply(job).await;
        }

        self.supervisor.disconnect().await;

        info!(account_id = self.follower.id, "follower worker stopped");
    }

    async fn apply(&mut self, job: TickJob) {
        if self.supervisor.health() == SessionHealth::PermanentlyFailed {
            debug!(
                account_id = self.follower.id,
                "session permanently failed; events ignored until re-registration"
            );
            let _ = job
                .done
                .send(TickReport {
                    account_id: self.follower.id,
                    ok: false,
                })
                .await;
            return;
        }

        let mut ok = true;

        if self.follower.copy_enabled {
            for event in job.events.iter() {
                let applied = match event {
                    CopyEvent::Closed { master_ticket, last } => {
                        self.replicate_close(*master_ticket, last).await
                    }
                    CopyEvent::Modified(p) => self.replicate_modify(p).await,
                    CopyEvent::Opened(p) => self.replicate_open(p).await,
                };
                if !applied {
                    ok = false;
                }
            }
        } else {
            debug!(
                account_id = self.follower.id,
                seq = job.seq,
                "copy disabled; events ignored"
            );
        }

        if ok {
            self.last_tick_ok_ms = now_ms();
        }

        let _ = job
            .done
            .send(TickReport {
                account_id: self.follower.id,
                ok,
            })
            .await;
    }

    async fn replicate_open(&mut self, p: &Position) -> bool {
        if self.position_map.contains_key(&p.ticket) {
            debug!(
                account_id = self.follower.id,
                master_ticket = p.ticket,
                "slave already mapped; open skipped"
            );
            return true;
        }
        if self.unknown_symbols.contains(&p.symbol) {
            return true;
        }
        if !self.pending.insert(p.ticket) {
            debug!(
                account_id = self.follower.id,
                master_ticket = p.ticket,
                "open already in flight; skipped"
            );
            return true;
        }

        let started = Instant::now();
        let desired = scale_volume(p.volume, self.follower.lot_multiplier);

        let result = match self.supervisor.ensure_connected().await {
            Ok(session) => {
                session
                    .open(OpenRequest {
                        symbol: p.symbol.clone(),
                        side: p.side,
                        volume: desired,
                        sl: p.sl,
                        tp: p.tp,
                        max_lot: self.follower.max_lot,
                        master_ticket: p.ticket,
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        self.pending.remove(&p.ticket);

        match result {
            Ok(receipt) => {
                if (receipt.volume - desired).abs() > f64::EPSILON {
                    info!(
                        account_id = self.follower.id,
                        master_ticket = p.ticket,
                        desired,
                        executed = receipt.volume,
                        event = "size_adjusted",
                        "volume clamped to broker constraints"
                    );
                }

                debug_assert!(
                    !self.position_map.values().any(|&s| s == receipt.ticket),
                    "slave ticket already mapped"
                );
                self.position_map.insert(p.ticket, receipt.ticket);

                self.counters.opens_ok.fetch_add(1, Ordering::Relaxed);
                info!(
                    account_id = self.follower.id,
                    master_ticket = p.ticket,
                    slave_ticket = receipt.ticket,
                    symbol = %p.symbol,
                    volume = receipt.volume,
                    "position copied"
                );

                self.journal_outcome(
                    "trade_opened",
                    p.ticket,
                    Some(receipt.ticket),
                    &p.symbol,
                    receipt.volume,
                    true,
                    "",
                    started,
                );
                self.notify(UserEvent::TradeOpened {
                    master_ticket: p.ticket,
                    slave_ticket: receipt.ticket,
                    symbol: p.symbol.clone(),
                    volume: receipt.volume,
                    side: p.side,
                })
                .await;
                true
            }
            Err(e) => {
                self.counters.opens_failed.fetch_add(1, Ordering::Relaxed);
                self.note_failure(&e).await;

                if let BrokerError::SymbolUnknown(_) = &e {
                    if self.unknown_symbols.insert(p.symbol.clone()) {
                        warn!(
                            account_id = self.follower.id,
                            symbol = %p.symbol,
                            "symbol unavailable on follower; further opens suppressed"
                        );
                    }
                } else {
                    warn!(
                        account_id = self.follower.id,
                        master_ticket = p.ticket,
                        symbol = %p.symbol,
                        error = %e,
                        "open replication failed"
                    );
                }

                self.journal_outcome(
                    "error",
                    p.ticket,
                    None,
                    &p.symbol,
                    desired,
                    false,
                    &e.to_string(),
                    started,
                );
                self.notify_error(Some(p.ticket), Some(p.symbol.clone()), &e)
                    .await;
                false
            }
        }
    }

    async fn replicate_close(&mut self, master_ticket: u64, last: &Position) -> bool {
        let Some(&slave_ticket) = self.position_map.get(&master_ticket) else {
            // Slave open never happened (failed or was suppressed); nothing
            // to unwind.
            info!(
                account_id = self.follower.id,
                master_ticket,
                event = "close_orphan",
                "no slave mapping for closed master ticket"
            );
            self.journal_outcome(
                "trade_closed",
                master_ticket,
                None,
                &last.symbol,
                0.0,
                true,
                "close_orphan",
                Instant::now(),
            );
            return true;
        };

        if !self.pending.insert(master_ticket) {
            return true;
        }

        let started = Instant::now();

        let result = match self.supervisor.ensure_connected().await {
            Ok(session) => session.close(slave_ticket, master_ticket).await,
            Err(e) => Err(e),
        };

        self.pending.remove(&master_ticket);

        match result {
            Ok(()) => {
                self.position_map.remove(&master_ticket);
                self.counters.closes_ok.fetch_add(1, Ordering::Relaxed);
                info!(
                    account_id = self.follower.id,
                    master_ticket,
                    slave_ticket,
                    "position closed"
                );

                self.journal_outcome(
                    "trade_closed",
                    master_ticket,
                    Some(slave_ticket),
                    &last.symbol,
                    last.volume,
                    true,
                    "",
                    started,
                );
                self.notify(UserEvent::TradeClosed {
                    master_ticket,
                    slave_ticket,
                    symbol: last.symbol.clone(),
                })
                .await;
                true
            }
            Err(e) => {
                if e == BrokerError::NotFound {
                    // Slave side is already flat; drop the stale mapping.
                    self.position_map.remove(&master_ticket);
                }

                self.counters.closes_failed.fetch_add(1, Ordering::Relaxed);
                self.note_failure(&e).await;
                warn!(
                    account_id = self.follower.id,
                    master_ticket,
                    slave_ticket,
                    error = %e,
                    "close replication failed"
                );

                self.journal_outcome(
                    "error",
                    master_ticket,
                    Some(slave_ticket),
                    &last.symbol,
                    last.volume,
                    false,
                    &e.to_string(),
                    started,
                );
                self.notify_error(Some(master_ticket), Some(last.symbol.clone()), &e)
                    .await;
                false
            }
        }
    }

    async fn replicate_modify(&mut self, p: &Position) -> bool {
        let Some(&slave_ticket) = self.position_map.get(&p.ticket) else {
            debug!(
                account_id = self.follower.id,
                master_ticket = p.ticket,
                "no slave mapping; modify skipped"
            );
            return true;
        };

        let started = Instant::now();

        let result = match self.supervisor.ensure_connected().await {
            Ok(session) => session.modify(slave_ticket, p.sl, p.tp).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.counters.modifies_ok.fetch_add(1, Ordering::Relaxed);
                self.journal_outcome(
                    "trade_modified",
                    p.ticket,
                    Some(slave_ticket),
                    &p.symbol,
                    p.volume,
                    true,
                    "",
                    started,
                );
                self.notify(UserEvent::TradeModified {
                    master_ticket: p.ticket,
                    slave_ticket,
                    sl: p.sl,
                    tp: p.tp,
                })
                .await;
                true
            }
            Err(e) => {
                // Best-effort: no retry this tick; the next SL/TP change on
                // the master re-derives the event.
                self.counters.modifies_failed.fetch_add(1, Ordering::Relaxed);
                self.note_failure(&e).await;
                warn!(
                    account_id = self.follower.id,
                    master_ticket = p.ticket,
                    slave_ticket,
                    error = %e,
                    "modify replication failed"
                );

                self.journal_outcome(
                    "error",
                    p.ticket,
                    Some(slave_ticket),
                    &p.symbol,
                    p.volume,
                    false,
                    &e.to_string(),
                    started,
                );
                self.notify_error(Some(p.ticket), Some(p.symbol.clone()), &e)
                    .await;
                false
            }
        }
    }

    async fn note_failure(&mut self, err: &BrokerError) {
        self.last_error = Some(err.to_string());
        self.supervisor.note_op_error(err);
        if self.supervisor.health() == SessionHealth::PermanentlyFailed {
            self.notify_auth_failed().await;
        }
    }

    async fn notify_auth_failed(&mut self) {
        if self.auth_notified {
            return;
        }
        self.auth_notified = true;
        let login = self.follower.login;
        self.notify(UserEvent::AuthFailed { login }).await;
    }

    async fn notify_error(
        &self,
        master_ticket: Option<u64>,
        symbol: Option<String>,
        err: &BrokerError,
    ) {
        // Backoff suppression is routine, not news to the user.
        if *err == BrokerError::RetryThrottled {
            return;
        }
        let code = match err {
            BrokerError::Rejected(c) => Some(*c),
            _ => None,
        };
        self.notify(UserEvent::ReplicationError {
            master_ticket,
            symbol,
            message: err.to_string(),
            code,
        })
        .await;
    }

    async fn notify(&self, event: UserEvent) {
        notify_user(
            self.notifier.as_ref(),
            self.notify_deadline,
            self.follower.user_id,
            self.follower.id,
            event,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    fn journal_outcome(
        &self,
        event_type: &str,
        master_ticket: u64,
        slave_ticket: Option<u64>,
        symbol: &str,
        volume: f64,
        success: bool,
        message: &str,
        started: Instant,
    ) {
        self.journal.record(CopyLogRecord {
            account_id: self.follower.id,
            event_type: event_type.to_string(),
            master_ticket,
            slave_ticket,
            symbol: symbol.to_string(),
            volume,
            success,
            message: message.to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            created_ms: now_ms(),
        });
    }
}
