use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("engine is not running")]
    NotRunning,

    #[error("engine already running")]
    AlreadyRunning,

    #[error("registration failed for account {id}: {reason}")]
    RegistrationFailed { id: u64, reason: String },

    #[error("engine control channel closed")]
    ControlClosed,
}
