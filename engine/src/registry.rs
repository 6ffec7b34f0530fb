//! Active follower set.
//!
//! The registry is owned exclusively by the engine control task; every
//! mutation arrives over the engine command channel, which linearizes
//! registrations against tick boundaries for free. Each entry holds the
//! handle of the follower's worker task; the worker owns all mutable
//! follower state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use broker::session::BrokerSession;
use broker::supervisor::SessionSupervisor;
use broker::terminal::TerminalHandle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::follower::Follower;
use crate::journal::Journal;
use crate::metrics::counters::Counters;
use crate::notify::Notifier;
use crate::replicator::TickJob;
use crate::replicator::worker::FollowerWorker;

pub struct FollowerHandle {
    pub follower: Follower,
    pub job_tx: mpsc::Sender<TickJob>,
    pub join: JoinHandle<()>,
}

pub struct Registry {
    terminal: TerminalHandle,
    notifier: Arc<dyn Notifier>,
    journal: Journal,
    counters: Counters,
    magic: u64,
    deviation: u32,
    notify_deadline: Duration,

    followers: HashMap<u64, FollowerHandle>,
}

impl Registry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        terminal: TerminalHandle,
        notifier: Arc<dyn Notifier>,
        journal: Journal,
        counters: Counters,
        magic: u64,
        deviation: u32,
        notify_deadline: Duration,
    ) -> Self {
        Self {
            terminal,
            notifier,
            journal,
            counters,
            magic,
            deviation,
            notify_deadline,
            followers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.followers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.followers.is_empty()
    }

    /// Spawn a worker for `follower` and wait for its registration-time
    /// connect. Already-registered ids are ignored.
    pub async fn register(&mut self, follower: Follower) -> Result<(), EngineError> {
        if self.followers.contains_key(&follower.id) {
            info!(account_id = follower.id, "already registered; ignored");
            return Ok(());
        }

        let id = follower.id;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (job_tx, join) = self.spawn_worker(follower.clone(), Some(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(
                    account_id = id,
                    login = follower.login,
                    "follower registered"
                );
                self.followers.insert(
                    id,
                    FollowerHandle {
                        follower,
                        job_tx,
                        join,
                    },
                );
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::RegistrationFailed {
                id,
                reason: e.to_string(),
            }),
            Err(_) => Err(EngineError::RegistrationFailed {
                id,
                reason: "worker exited before reporting readiness".to_string(),
            }),
        }
    }

    /// Detach a follower from the active set. The returned handle still owns
    /// the running worker; the caller drives its drain/cancel.
    pub fn remove(&mut self, id: u64) -> Option<FollowerHandle> {
        self.followers.remove(&id)
    }

    /// Detach every follower (engine shutdown).
    pub fn drain(&mut self) -> Vec<FollowerHandle> {
        self.followers.drain().map(|(_, h)| h).collect()
    }

    /// Job sender for one follower, if registered.
    pub fn job_sender(&self, id: u64) -> Option<mpsc::Sender<TickJob>> {
        self.followers.get(&id).map(|h| h.job_tx.clone())
    }

    /// Stable view of the active set for one tick.
    pub fn snapshot_active(&self) -> Vec<(u64, mpsc::Sender<TickJob>)> {
        self.followers
            .iter()
            .map(|(id, h)| (*id, h.job_tx.clone()))
            .collect()
    }

    /// Replace a dead worker with a fresh one (lazy reconnect, empty
    /// position map). The slave book is re-derived from future master
    /// events; orphaned slave positions surface as `close_orphan`.
    pub fn respawn(&mut self, id: u64) -> bool {
        let Some(old) = self.followers.remove(&id) else {
            return false;
        };

        warn!(
            account_id = id,
            "follower worker died; respawning with empty position map"
        );

        let follower = old.follower;
        let (job_tx, join) = self.spawn_worker(follower.clone(), None);

        self.followers.insert(
            id,
            FollowerHandle {
                follower,
                job_tx,
                join,
            },
        );
        true
    }

    fn spawn_worker(
        &self,
        follower: Follower,
        ready: Option<oneshot::Sender<Result<(), broker::BrokerError>>>,
    ) -> (mpsc::Sender<TickJob>, JoinHandle<()>) {
        // Capacity 1: the control loop never dispatches a new tick while the
        // previous one is in flight, so a deeper queue would only hide bugs.
        let (job_tx, job_rx) = mpsc::channel(1);

        let session = BrokerSession::new(
            self.terminal.clone(),
            follower.credentials(),
            self.magic,
            self.deviation,
        );
        let supervisor = SessionSupervisor::new(session);

        let worker = FollowerWorker::new(
            follower,
            supervisor,
            self.notifier.clone(),
            self.journal.clone(),
            self.counters.clone(),
            self.notify_deadline,
        );

        let join = tokio::spawn(worker.run(job_rx, ready));

        (job_tx, join)
    }
}
