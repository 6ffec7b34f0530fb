//! Serialized access to the process-scoped vendor terminal.
//!
//! The vendor library holds a single active login per process, so every call
//! that assumes "logged in as X" must be serialized and preceded by an
//! identity switch. This module owns that constraint:
//!
//! - One dedicated worker thread owns the `TerminalApi` handle and drains a
//!   command queue; no two operations ever overlap on the terminal.
//! - The worker switches login before operating for a different account and
//!   caches the current identity to skip redundant logins.
//! - Compound trade operations (symbol lookup → tick → order send) run as a
//!   single queued command, so another account can never interleave mid-way.
//! - Callers apply the per-operation deadline; a timed-out command is
//!   abandoned (its reply is dropped) and the queue keeps draining.

use std::io;
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::types::{
    AccountState, CloseOrder, CloseSpec, Credentials, FillPolicy, OpenOrder, OpenReceipt, OpenSpec,
    Position, Side, SymbolInfo, TickQuote, TimeInForce, clamp_volume,
};

/// Backlog bound for queued terminal commands.
const QUEUE_CAPACITY: usize = 64;

/// Blocking interface over the native vendor library.
///
/// Implementations wrap the vendor FFI; every method may take tens to
/// hundreds of milliseconds. Errors must be mapped onto `BrokerError` by the
/// implementation; symbol-name translation between broker feeds is also the
/// implementation's concern.
pub trait TerminalApi: Send + 'static {
    fn login(&mut self, creds: &Credentials) -> Result<(), BrokerError>;
    fn positions(&mut self) -> Result<Vec<Position>, BrokerError>;
    fn pending_orders(&mut self) -> Result<u32, BrokerError>;
    fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, BrokerError>;
    fn tick(&mut self, symbol: &str) -> Result<TickQuote, BrokerError>;
    fn position(&mut self, ticket: u64) -> Result<Option<Position>, BrokerError>;
    /// Submit a market open; returns the broker-assigned ticket.
    fn market_open(&mut self, order: &OpenOrder) -> Result<u64, BrokerError>;
    fn market_close(&mut self, order: &CloseOrder) -> Result<(), BrokerError>;
    fn modify_sltp(&mut self, ticket: u64, sl: f64, tp: f64) -> Result<(), BrokerError>;
    fn shutdown(&mut self);
}

type Reply<T> = oneshot::Sender<Result<T, BrokerError>>;

enum TerminalCall {
    Connect {
        creds: Credentials,
        reply: Reply<()>,
    },
    ReadState {
        creds: Credentials,
        reply: Reply<AccountState>,
    },
    Open {
        creds: Credentials,
        spec: OpenSpec,
        reply: Reply<OpenReceipt>,
    },
    Close {
        creds: Credentials,
        spec: CloseSpec,
        reply: Reply<()>,
    },
    Modify {
        creds: Credentials,
        ticket: u64,
        sl: f64,
        tp: f64,
        reply: Reply<()>,
    },
    /// Drop the cached identity for `login` so the next command re-logins.
    Logout {
        login: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable async handle to the terminal worker.
///
/// All sessions in the process share one handle; the underlying queue is the
/// "terminal mutex" of the design.
#[derive(Clone, Debug)]
pub struct TerminalHandle {
    tx: mpsc::Sender<TerminalCall>,
    op_deadline: Duration,
}

/// Spawner for the terminal worker thread.
pub struct Terminal;

impl Terminal {
    /// Start the worker thread that owns `api` and return the shared handle.
    pub fn spawn(api: Box<dyn TerminalApi>, op_deadline: Duration) -> io::Result<TerminalHandle> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        thread::Builder::new()
            .name("terminal-worker".to_string())
            .spawn(move || run_worker(api, rx))?;

        Ok(TerminalHandle { tx, op_deadline })
    }
}

impl TerminalHandle {
    pub fn op_deadline(&self) -> Duration {
        self.op_deadline
    }

    pub async fn connect(&self, creds: Credentials) -> Result<(), BrokerError> {
        self.call(|reply| TerminalCall::Connect { creds, reply })
            .await
    }

    pub async fn read_state(&self, creds: Credentials) -> Result<AccountState, BrokerError> {
        self.call(|reply| TerminalCall::ReadState { creds, reply })
            .await
    }

    pub async fn open(&self, creds: Credentials, spec: OpenSpec) -> Result<OpenReceipt, BrokerError> {
        self.call(|reply| TerminalCall::Open { creds, spec, reply })
            .await
    }

    pub async fn close(&self, creds: Credentials, spec: CloseSpec) -> Result<(), BrokerError> {
        self.call(|reply| TerminalCall::Close { creds, spec, reply })
            .await
    }

    pub async fn modify(
        &self,
        creds: Credentials,
        ticket: u64,
        sl: f64,
        tp: f64,
    ) -> Result<(), BrokerError> {
        self.call(|reply| TerminalCall::Modify {
            creds,
            ticket,
            sl,
            tp,
            reply,
        })
        .await
    }

    /// Best-effort identity invalidation; never blocks on the deadline.
    pub async fn logout(&self, login: u64) {
        let _ = self.tx.send(TerminalCall::Logout { login }).await;
    }

    /// Stop the worker thread after the current backlog drains.
    pub async fn shutdown(&self) {
        let (reply, ack) = oneshot::channel();
        if self.tx.send(TerminalCall::Shutdown { reply }).await.is_ok() {
            let _ = ack.await;
        }
    }

    async fn call<T, F>(&self, make: F) -> Result<T, BrokerError>
    where
        F: FnOnce(Reply<T>) -> TerminalCall,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call = make(reply_tx);
        let tx = self.tx.clone();

        let fut = async move {
            if tx.send(call).await.is_err() {
                return Err(BrokerError::Unreachable);
            }
            match reply_rx.await {
                Ok(res) => res,
                // Worker gone mid-call.
                Err(_) => Err(BrokerError::Unreachable),
            }
        };

        match timeout(self.op_deadline, fut).await {
            Ok(res) => res,
            Err(_) => {
                warn!(
                    target: "terminal",
                    deadline_ms = self.op_deadline.as_millis() as u64,
                    "terminal operation abandoned on deadline; slave state unknown until next read"
                );
                Err(BrokerError::Timeout)
            }
        }
    }
}

fn run_worker(api: Box<dyn TerminalApi>, mut rx: mpsc::Receiver<TerminalCall>) {
    let mut worker = Worker {
        api,
        current_login: None,
    };

    info!(target: "terminal", "terminal worker started");

    while let Some(call) = rx.blocking_recv() {
        match call {
            TerminalCall::Connect { creds, reply } => {
                let _ = reply.send(worker.ensure_login(&creds));
            }
            TerminalCall::ReadState { creds, reply } => {
                let _ = reply.send(worker.read_state(&creds));
            }
            TerminalCall::Open { creds, spec, reply } => {
                let _ = reply.send(worker.open(&creds, &spec));
            }
            TerminalCall::Close { creds, spec, reply } => {
                let _ = reply.send(worker.close(&creds, &spec));
            }
            TerminalCall::Modify {
                creds,
                ticket,
                sl,
                tp,
                reply,
            } => {
                let _ = reply.send(worker.modify(&creds, ticket, sl, tp));
            }
            TerminalCall::Logout { login } => worker.logout(login),
            TerminalCall::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }

    worker.api.shutdown();
    info!(target: "terminal", "terminal worker stopped");
}

struct Worker {
    api: Box<dyn TerminalApi>,
    current_login: Option<u64>,
}

impl Worker {
    fn ensure_login(&mut self, creds: &Credentials) -> Result<(), BrokerError> {
        if self.current_login == Some(creds.login) {
            return Ok(());
        }

        debug!(target: "terminal", login = creds.login, "switching terminal identity");

        // Invalidate first: a failed login leaves the terminal in an
        // indeterminate identity.
        self.current_login = None;
        self.api.login(creds)?;
        self.current_login = Some(creds.login);
        Ok(())
    }

    fn read_state(&mut self, creds: &Credentials) -> Result<AccountState, BrokerError> {
        self.ensure_login(creds)?;

        let positions = self.api.positions()?;
        let pending_orders = self.api.pending_orders()?;

        Ok(AccountState {
            positions: positions.into_iter().map(|p| (p.ticket, p)).collect(),
            pending_orders,
        })
    }

    fn open(&mut self, creds: &Credentials, spec: &OpenSpec) -> Result<OpenReceipt, BrokerError> {
        self.ensure_login(creds)?;

        let info = self.api.symbol_info(&spec.symbol)?;
        let volume = clamp_volume(spec.volume, info.volume_min, spec.max_lot);

        let quote = self.api.tick(&spec.symbol)?;
        let price = match spec.side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };

        let order = OpenOrder {
            symbol: spec.symbol.clone(),
            side: spec.side,
            volume,
            price,
            sl: spec.sl,
            tp: spec.tp,
            deviation: spec.deviation,
            magic: spec.magic,
            comment: format!("COPY:{}", spec.master_ticket),
            filling: FillPolicy::ImmediateOrCancel,
            lifetime: TimeInForce::GoodTillCancel,
        };

        let ticket = self.api.market_open(&order)?;

        Ok(OpenReceipt {
            ticket,
            volume,
            price,
        })
    }

    fn close(&mut self, creds: &Credentials, spec: &CloseSpec) -> Result<(), BrokerError> {
        self.ensure_login(creds)?;

        let pos = self
            .api
            .position(spec.slave_ticket)?
            .ok_or(BrokerError::NotFound)?;

        let quote = self.api.tick(&pos.symbol)?;
        let side = pos.side.closing();
        let price = match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };

        let order = CloseOrder {
            ticket: spec.slave_ticket,
            symbol: pos.symbol.clone(),
            side,
            volume: pos.volume,
            price,
            deviation: spec.deviation,
            magic: spec.magic,
            comment: format!("CLOSE_COPY:{}", spec.master_ticket),
            filling: FillPolicy::ImmediateOrCancel,
            lifetime: TimeInForce::GoodTillCancel,
        };

        self.api.market_close(&order)
    }

    fn modify(
        &mut self,
        creds: &Credentials,
        ticket: u64,
        sl: f64,
        tp: f64,
    ) -> Result<(), BrokerError> {
        self.ensure_login(creds)?;
        self.api.modify_sltp(ticket, sl, tp)
    }

    fn logout(&mut self, login: u64) {
        if self.current_login == Some(login) {
            self.current_login = None;
        }
    }
}
