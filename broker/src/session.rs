//! Per-account facade over the shared terminal worker.
//!
//! A `BrokerSession` is one logical login: it pins the credentials, magic
//! number, and slippage cap for an account and routes every operation
//! through the serialized [`TerminalHandle`]. The handle applies the
//! per-operation deadline; this layer only shapes requests.

use tracing::debug;

use crate::error::BrokerError;
use crate::terminal::TerminalHandle;
use crate::types::{AccountState, CloseSpec, Credentials, OpenReceipt, OpenSpec, Side};

/// Open request as seen by the replication layer: desired (already scaled)
/// volume plus the follower's lot cap.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub sl: f64,
    pub tp: f64,
    /// 0.0 = uncapped.
    pub max_lot: f64,
    pub master_ticket: u64,
}

#[derive(Debug)]
pub struct BrokerSession {
    creds: Credentials,
    terminal: TerminalHandle,
    magic: u64,
    deviation: u32,
}

impl BrokerSession {
    pub fn new(terminal: TerminalHandle, creds: Credentials, magic: u64, deviation: u32) -> Self {
        Self {
            creds,
            terminal,
            magic,
            deviation,
        }
    }

    pub fn login(&self) -> u64 {
        self.creds.login
    }

    /// Probe the login; the terminal caches the identity on success.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.terminal.connect(self.creds.clone()).await
    }

    /// Read all open positions and the pending-order count for this account.
    pub async fn read_state(&self) -> Result<AccountState, BrokerError> {
        self.terminal.read_state(self.creds.clone()).await
    }

    /// Open a market position tagged `COPY:<master_ticket>`.
    pub async fn open(&self, req: OpenRequest) -> Result<OpenReceipt, BrokerError> {
        let spec = OpenSpec {
            symbol: req.symbol,
            side: req.side,
            volume: req.volume,
            sl: req.sl,
            tp: req.tp,
            max_lot: req.max_lot,
            deviation: self.deviation,
            magic: self.magic,
            master_ticket: req.master_ticket,
        };
        self.terminal.open(self.creds.clone(), spec).await
    }

    /// Close a slave position, tagged `CLOSE_COPY:<master_ticket>`.
    pub async fn close(&self, slave_ticket: u64, master_ticket: u64) -> Result<(), BrokerError> {
        let spec = CloseSpec {
            slave_ticket,
            master_ticket,
            deviation: self.deviation,
            magic: self.magic,
        };
        self.terminal.close(self.creds.clone(), spec).await
    }

    /// Re-point the protective levels of a slave position. Best-effort.
    pub async fn modify(&self, slave_ticket: u64, sl: f64, tp: f64) -> Result<(), BrokerError> {
        self.terminal
            .modify(self.creds.clone(), slave_ticket, sl, tp)
            .await
    }

    /// Logical disconnect. Idempotent: only invalidates the cached terminal
    /// identity; the shared worker keeps serving other accounts.
    pub async fn disconnect(&self) {
        debug!(login = self.creds.login, "session disconnect");
        self.terminal.logout(self.creds.login).await;
    }
}
