//! Engine orchestrator.
//!
//! Owns the tick clock, the shadow snapshot, and the registry. All control
//! traffic (register, unregister, health, shutdown) flows through one
//! command channel into a single control task, so registry mutations are
//! linearized against tick boundaries by construction.
//!
//! Tick policy:
//! - A snapshot arriving while the previous tick's replication is still in
//!   flight is dropped (never queued) and counted as skipped.
//! - The shadow snapshot advances only after all follower dispatches for the
//!   tick, so tick N+1 always diffs against what tick N observed.
//! - The first observed snapshot is the baseline: pre-existing master
//!   positions produce no events.
//!
//! A follower-local failure never reaches this layer; the engine only stops
//! when told to.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use broker::session::BrokerSession;
use broker::terminal::TerminalHandle;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::follower::Follower;
use crate::journal::{CopyLogStore, spawn_writer};
use crate::master::diff::diff;
use crate::master::snapshot::MasterSnapshot;
use crate::master::watcher::MasterWatcher;
use crate::metrics::counters::Counters;
use crate::notify::Notifier;
use crate::registry::{FollowerHandle, Registry};
use crate::replicator::TickJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub running: bool,
    pub active_followers: u32,
    pub last_tick_at_ms: Option<u64>,
    pub ticks_skipped: u64,
}

enum EngineCommand {
    Register {
        follower: Follower,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Unregister {
        id: u64,
        reply: oneshot::Sender<bool>,
    },
    Health {
        reply: oneshot::Sender<EngineHealth>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct Engine {
    cfg: EngineConfig,
    terminal: TerminalHandle,
    notifier: Arc<dyn Notifier>,
    log_store: Arc<dyn CopyLogStore>,
    counters: Counters,
    state: Mutex<Lifecycle>,
    cmd_tx: Mutex<Option<mpsc::Sender<EngineCommand>>>,
}

impl Engine {
    /// Validates configuration; invalid config is fatal here, before any
    /// task is spawned.
    pub fn new(
        cfg: EngineConfig,
        terminal: TerminalHandle,
        notifier: Arc<dyn Notifier>,
        log_store: Arc<dyn CopyLogStore>,
    ) -> Result<Self, EngineError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            terminal,
            notifier,
            log_store,
            counters: Counters::default(),
            state: Mutex::new(Lifecycle::Stopped),
            cmd_tx: Mutex::new(None),
        })
    }

    pub fn counters(&self) -> Counters {
        self.counters.clone()
    }

    /// Launch the master watcher, journal writer, and control loop.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let mut st = self.state.lock();
            if *st != Lifecycle::Stopped {
                return Err(EngineError::AlreadyRunning);
            }
            *st = Lifecycle::Starting;
        }

        info!("engine starting");

        let (journal, _writer) =
            spawn_writer(self.log_store.clone(), self.cfg.journal_queue_capacity);

        // Capacity 1: the watcher drops snapshots the control loop has not
        // consumed yet; ticks are never queued.
        let (snap_tx, snap_rx) = mpsc::channel(1);

        let master_session = BrokerSession::new(
            self.terminal.clone(),
            self.cfg.master_credentials(),
            self.cfg.magic_number,
            self.cfg.max_slippage_points,
        );
        let watcher = MasterWatcher::new(
            master_session,
            self.cfg.poll_interval(),
            snap_tx,
            self.counters.clone(),
        );
        let watcher_join = tokio::spawn(watcher.run());

        let registry = Registry::new(
            self.terminal.clone(),
            self.notifier.clone(),
            journal,
            self.counters.clone(),
            self.cfg.magic_number,
            self.cfg.max_slippage_points,
            self.cfg.op_deadline(),
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let control = ControlLoop {
            cfg: self.cfg.clone(),
            registry,
            counters: self.counters.clone(),
            shadow: None,
            last_tick_at_ms: None,
            seq: 0,
            tick_busy: Arc::new(AtomicBool::new(false)),
            watcher_join,
        };
        tokio::spawn(control.run(cmd_rx, snap_rx));

        *self.cmd_tx.lock() = Some(cmd_tx);
        *self.state.lock() = Lifecycle::Running;

        info!(
            poll_interval_ms = self.cfg.poll_interval_ms,
            master_login = self.cfg.master_login,
            "engine running"
        );
        Ok(())
    }

    /// Signal shutdown and wait for in-flight replication to drain, bounded
    /// by the shutdown deadline. Idempotent.
    pub async fn stop(&self) {
        {
            let mut st = self.state.lock();
            if *st != Lifecycle::Running {
                return;
            }
            *st = Lifecycle::Stopping;
        }

        let tx = self.cmd_tx.lock().take();
        if let Some(tx) = tx {
            let (reply, ack) = oneshot::channel();
            if tx.send(EngineCommand::Shutdown { reply }).await.is_ok() {
                // Grace on top of the deadline the control loop enforces.
                let grace = self.cfg.shutdown_deadline() + Duration::from_secs(1);
                if timeout(grace, ack).await.is_err() {
                    warn!("control loop did not acknowledge shutdown in time");
                }
            }
        }

        *self.state.lock() = Lifecycle::Stopped;
        info!("engine stopped");
    }

    /// Register a follower. Completes after the registration-time connect;
    /// the follower participates from the next tick boundary.
    pub async fn register(&self, follower: Follower) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Register { follower, reply }).await?;
        rx.await.map_err(|_| EngineError::ControlClosed)?
    }

    /// Unregister a follower. Completes once its in-flight work has drained
    /// or been cancelled past the unregister deadline. Returns whether the
    /// follower was present.
    pub async fn unregister(&self, id: u64) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Unregister { id, reply }).await?;
        rx.await.map_err(|_| EngineError::ControlClosed)
    }

    pub async fn health(&self) -> EngineHealth {
        let tx = self.cmd_tx.lock().clone();
        if let Some(tx) = tx {
            let (reply, rx) = oneshot::channel();
            if tx.send(EngineCommand::Health { reply }).await.is_ok() {
                if let Ok(health) = rx.await {
                    return health;
                }
            }
        }

        EngineHealth {
            running: false,
            active_followers: 0,
            last_tick_at_ms: None,
            ticks_skipped: self.counters.ticks_skipped.load(Ordering::Relaxed),
        }
    }

    async fn send(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        let tx = self.cmd_tx.lock().clone().ok_or(EngineError::NotRunning)?;
        tx.send(cmd).await.map_err(|_| EngineError::ControlClosed)
    }
}

struct ControlLoop {
    cfg: EngineConfig,
    registry: Registry,
    counters: Counters,
    shadow: Option<MasterSnapshot>,
    last_tick_at_ms: Option<u64>,
    seq: u64,
    /// Set while a tick's follower dispatches are still completing.
    tick_busy: Arc<AtomicBool>,
    watcher_join: JoinHandle<()>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut snap_rx: mpsc::Receiver<MasterSnapshot>,
    ) {
        let mut watcher_alive = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(EngineCommand::Register { follower, reply }) => {
                        let res = self.registry.register(follower).await;
                        let _ = reply.send(res);
                    }
                    Some(EngineCommand::Unregister { id, reply }) => {
                        self.unregister(id, reply);
                    }
                    Some(EngineCommand::Health { reply }) => {
                        let _ = reply.send(self.health());
                    }
                    Some(EngineCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        // Engine handle dropped without stop(); clean up anyway.
                        self.shutdown().await;
                        break;
                    }
                },
                snap = snap_rx.recv(), if watcher_alive => match snap {
                    Some(snapshot) => self.on_snapshot(snapshot),
                    None => {
                        warn!("master watcher channel closed unexpectedly");
                        watcher_alive = false;
                    }
                },
            }
        }

        info!("control loop exited");
    }

    fn on_snapshot(&mut self, snapshot: MasterSnapshot) {
        if self.tick_busy.load(Ordering::Acquire) {
            self.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            debug!("previous tick still in flight; tick skipped");
            return;
        }

        self.seq += 1;
        self.counters.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.last_tick_at_ms = Some(snapshot.captured_at_ms);

        let Some(shadow) = &self.shadow else {
            info!(
                positions = snapshot.len(),
                pending_orders = snapshot.pending_orders,
                "baseline snapshot captured; pre-existing positions not replayed"
            );
            self.shadow = Some(snapshot);
            return;
        };

        let events = diff(shadow, &snapshot);
        if events.is_empty() {
            self.shadow = Some(snapshot);
            return;
        }

        info!(
            seq = self.seq,
            events = events.len(),
            followers = self.registry.len(),
            "master activity detected"
        );

        let active = self.registry.snapshot_active();
        if active.is_empty() {
            self.shadow = Some(snapshot);
            return;
        }

        let (done_tx, done_rx) = mpsc::channel(active.len());
        let events = Arc::new(events);
        let mut dispatched = 0usize;

        for (id, tx) in active {
            let job = TickJob {
                seq: self.seq,
                events: Arc::clone(&events),
                done: done_tx.clone(),
            };

            match tx.try_send(job) {
                Ok(()) => dispatched += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        account_id = id,
                        "follower worker still busy; its events are dropped this tick"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(job)) => {
                    // One-shot recovery: respawn the dead worker and hand it
                    // this tick's job.
                    if self.registry.respawn(id) {
                        if let Some(ntx) = self.registry.job_sender(id) {
                            if ntx.try_send(job).is_ok() {
                                dispatched += 1;
                            }
                        }
                    }
                }
            }
        }

        drop(done_tx);

        // Shadow advances after dispatch so tick N+1 diffs strictly against
        // this observation, regardless of per-follower outcomes.
        self.shadow = Some(snapshot);

        if dispatched > 0 {
            self.tick_busy.store(true, Ordering::Release);
            let busy = Arc::clone(&self.tick_busy);
            let seq = self.seq;

            tokio::spawn(async move {
                let mut done_rx = done_rx;
                let mut ok = 0u32;
                let mut failed = 0u32;
                while let Some(report) = done_rx.recv().await {
                    if report.ok {
                        ok += 1;
                    } else {
                        failed += 1;
                    }
                }
                busy.store(false, Ordering::Release);
                debug!(seq, ok, failed, "tick replication complete");
            });
        }
    }

    fn unregister(&mut self, id: u64, reply: oneshot::Sender<bool>) {
        let Some(handle) = self.registry.remove(id) else {
            let _ = reply.send(false);
            return;
        };

        info!(account_id = id, "unregistering follower");
        let deadline = self.cfg.unreg_deadline();

        // Quiescence is awaited off the control loop so ticks keep flowing.
        tokio::spawn(async move {
            let FollowerHandle { job_tx, mut join, .. } = handle;
            drop(job_tx);

            if timeout(deadline, &mut join).await.is_err() {
                warn!(
                    account_id = id,
                    "unregister deadline exceeded; cancelling worker"
                );
                join.abort();
            }

            let _ = reply.send(true);
        });
    }

    fn health(&self) -> EngineHealth {
        EngineHealth {
            running: true,
            active_followers: self.registry.len() as u32,
            last_tick_at_ms: self.last_tick_at_ms,
            ticks_skipped: self.counters.ticks_skipped.load(Ordering::Relaxed),
        }
    }

    async fn shutdown(&mut self) {
        info!("engine stopping; draining follower workers");

        self.watcher_join.abort();

        let handles = self.registry.drain();
        let mut joins = Vec::with_capacity(handles.len());
        for handle in handles {
            let FollowerHandle { job_tx, join, .. } = handle;
            drop(job_tx);
            joins.push(join);
        }

        if joins.is_empty() {
            return;
        }

        let deadline = self.cfg.shutdown_deadline();
        if timeout(deadline, join_all(joins.iter_mut())).await.is_err() {
            warn!("shutdown deadline exceeded; abandoning in-flight replication");
            for join in &joins {
                join.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use broker::error::BrokerError;
    use broker::terminal::{Terminal, TerminalApi};
    use broker::types::{
        CloseOrder, Credentials, OpenOrder, Position, SymbolInfo, TickQuote,
    };

    use crate::journal::CopyLogRecord;

    struct EmptyApi;

    impl TerminalApi for EmptyApi {
        fn login(&mut self, _: &Credentials) -> Result<(), BrokerError> {
            Ok(())
        }
        fn positions(&mut self) -> Result<Vec<Position>, BrokerError> {
            Ok(vec![])
        }
        fn pending_orders(&mut self) -> Result<u32, BrokerError> {
            Ok(0)
        }
        fn symbol_info(&mut self, s: &str) -> Result<SymbolInfo, BrokerError> {
            Ok(SymbolInfo {
                name: s.to_string(),
                volume_min: 0.01,
                digits: 5,
            })
        }
        fn tick(&mut self, _: &str) -> Result<TickQuote, BrokerError> {
            Err(BrokerError::NoTick)
        }
        fn position(&mut self, _: u64) -> Result<Option<Position>, BrokerError> {
            Ok(None)
        }
        fn market_open(&mut self, _: &OpenOrder) -> Result<u64, BrokerError> {
            Err(BrokerError::NoTick)
        }
        fn market_close(&mut self, _: &CloseOrder) -> Result<(), BrokerError> {
            Err(BrokerError::NotFound)
        }
        fn modify_sltp(&mut self, _: u64, _: f64, _: f64) -> Result<(), BrokerError> {
            Err(BrokerError::NotFound)
        }
        fn shutdown(&mut self) {}
    }

    struct NullNotifier;

    #[async_trait]
    impl Notifier for NullNotifier {
        async fn send_to_user(&self, _: &str, _: serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NullStore;

    #[async_trait]
    impl CopyLogStore for NullStore {
        async fn append(&self, _: &CopyLogRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn mk_engine() -> Engine {
        let cfg = EngineConfig {
            poll_interval_ms: 50,
            max_slippage_points: 10,
            magic_number: 99_999,
            op_deadline_ms: 1_000,
            unreg_deadline_ms: 1_000,
            shutdown_deadline_ms: 1_000,
            master_login: 111,
            master_password: "pw".to_string(),
            master_server: "Demo".to_string(),
            journal_queue_capacity: 64,
        };
        let terminal = Terminal::spawn(Box::new(EmptyApi), cfg.op_deadline()).unwrap();
        Engine::new(cfg, terminal, Arc::new(NullNotifier), Arc::new(NullStore)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_is_not_reentrant() {
        let engine = mk_engine();
        engine.start().await.unwrap();
        assert!(matches!(
            engine.start().await,
            Err(EngineError::AlreadyRunning)
        ));
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_requires_running_engine() {
        let engine = mk_engine();

        let follower = Follower {
            id: 1,
            user_id: 1,
            login: 2,
            server: "Demo".to_string(),
            password: "pw".to_string(),
            lot_multiplier: 1.0,
            max_lot: 0.0,
            copy_enabled: true,
        };

        assert!(matches!(
            engine.register(follower).await,
            Err(EngineError::NotRunning)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_idempotent() {
        let engine = mk_engine();
        engine.start().await.unwrap();
        engine.stop().await;
        engine.stop().await;

        let health = engine.health().await;
        assert!(!health.running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_config_is_fatal_at_construction() {
        let mut cfg = EngineConfig {
            poll_interval_ms: 50,
            max_slippage_points: 10,
            magic_number: 99_999,
            op_deadline_ms: 1_000,
            unreg_deadline_ms: 1_000,
            shutdown_deadline_ms: 1_000,
            master_login: 111,
            master_password: "pw".to_string(),
            master_server: "Demo".to_string(),
            journal_queue_capacity: 64,
        };
        cfg.poll_interval_ms = 1;

        let terminal = Terminal::spawn(Box::new(EmptyApi), Duration::from_secs(1)).unwrap();
        assert!(
            Engine::new(cfg, terminal, Arc::new(NullNotifier), Arc::new(NullStore)).is_err()
        );
    }
}
