use thiserror::Error;

/// Errors surfaced by the vendor terminal layer.
///
/// `Rejected` carries the raw broker return code so callers can log it
/// without interpreting vendor-specific retcode tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("authentication failed")]
    AuthFailed,

    #[error("terminal unreachable")]
    Unreachable,

    #[error("vendor terminal busy")]
    VendorBusy,

    #[error("unknown symbol: {0}")]
    SymbolUnknown(String),

    #[error("order rejected by broker (retcode {0})")]
    Rejected(u32),

    #[error("no tick available")]
    NoTick,

    #[error("position not found")]
    NotFound,

    #[error("operation deadline exceeded")]
    Timeout,

    #[error("reconnect suppressed by backoff")]
    RetryThrottled,
}

impl BrokerError {
    /// True if the session should not be retried without re-registration.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::AuthFailed)
    }
}
