//! Connection lifecycle for one follower session.
//!
//! The supervisor reconnects lazily: nothing happens on failure until the
//! next operation needs the session, and failed sessions are retried no more
//! often than once per backoff window. A fatal authentication failure parks
//! the session permanently; only re-registration creates a fresh one.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::session::BrokerSession;

/// Default minimum spacing between reconnect attempts (1 token / 2 s).
const RETRY_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    PermanentlyFailed,
}

pub struct SessionSupervisor {
    session: BrokerSession,
    health: SessionHealth,
    last_attempt: Option<Instant>,
    retry_after: Duration,
}

impl SessionSupervisor {
    pub fn new(session: BrokerSession) -> Self {
        Self {
            session,
            health: SessionHealth::Disconnected,
            last_attempt: None,
            retry_after: RETRY_AFTER,
        }
    }

    /// Override the reconnect spacing. Used by tests.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn health(&self) -> SessionHealth {
        self.health
    }

    pub fn login(&self) -> u64 {
        self.session.login()
    }

    /// Return a usable session, connecting first if necessary.
    ///
    /// - `Connected` sessions are handed out directly.
    /// - `Failed` sessions are retried at most once per backoff window;
    ///   inside the window the call fails fast with `RetryThrottled`.
    /// - `PermanentlyFailed` sessions always fail with `AuthFailed`.
    pub async fn ensure_connected(&mut self) -> Result<&BrokerSession, BrokerError> {
        match self.health {
            SessionHealth::Connected => return Ok(&self.session),
            SessionHealth::PermanentlyFailed => return Err(BrokerError::AuthFailed),
            SessionHealth::Failed => {
                if let Some(at) = self.last_attempt {
                    if at.elapsed() < self.retry_after {
                        return Err(BrokerError::RetryThrottled);
                    }
                }
            }
            SessionHealth::Disconnected | SessionHealth::Connecting => {}
        }

        self.health = SessionHealth::Connecting;
        self.last_attempt = Some(Instant::now());

        match self.session.connect().await {
            Ok(()) => {
                info!(login = self.session.login(), "session connected");
                self.health = SessionHealth::Connected;
                Ok(&self.session)
            }
            Err(BrokerError::AuthFailed) => {
                warn!(
                    login = self.session.login(),
                    "authentication rejected; session parked until re-registration"
                );
                self.health = SessionHealth::PermanentlyFailed;
                Err(BrokerError::AuthFailed)
            }
            Err(e) => {
                warn!(login = self.session.login(), error = %e, "connect failed");
                self.health = SessionHealth::Failed;
                Err(e)
            }
        }
    }

    /// Record an operation failure that invalidates the connection, so the
    /// next use reconnects instead of trusting a dead login.
    pub fn note_op_error(&mut self, err: &BrokerError) {
        match err {
            BrokerError::Unreachable => {
                if self.health == SessionHealth::Connected {
                    self.health = SessionHealth::Failed;
                }
            }
            BrokerError::AuthFailed => {
                self.health = SessionHealth::PermanentlyFailed;
            }
            // Trade-level rejections and timeouts say nothing about the
            // login itself.
            _ => {}
        }
    }

    /// Disconnect and reset to `Disconnected`. Idempotent.
    pub async fn disconnect(&mut self) {
        self.session.disconnect().await;
        if self.health != SessionHealth::PermanentlyFailed {
            self.health = SessionHealth::Disconnected;
        }
    }
}
