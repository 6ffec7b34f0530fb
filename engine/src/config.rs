use std::fmt;
use std::time::Duration;

use crate::error::EngineError;

/// Lower bound on the tick period; anything faster hammers the vendor
/// terminal without improving replication latency.
const MIN_POLL_INTERVAL_MS: u64 = 50;

#[derive(Clone)]
pub struct EngineConfig {
    // =========================
    // Tick loop
    // =========================
    /// Master poll period in milliseconds. Each tick reads the master
    /// account and diffs the result against the shadow snapshot.
    pub poll_interval_ms: u64,

    // =========================
    // Trade requests
    // =========================
    /// Maximum accepted price drift (points) on every market order.
    pub max_slippage_points: u32,

    /// Magic number stamped on every engine-originated order so copied
    /// trades are distinguishable from manual ones.
    pub magic_number: u64,

    // =========================
    // Deadlines
    // =========================
    /// Per-operation deadline for any single vendor call. A hung call is
    /// abandoned past this point and the slave state is resolved by the
    /// next master read.
    pub op_deadline_ms: u64,

    /// How long `unregister` waits for a follower's in-flight work before
    /// cancelling it.
    pub unreg_deadline_ms: u64,

    /// How long `stop` waits for all in-flight replication before
    /// abandoning tasks.
    pub shutdown_deadline_ms: u64,

    // =========================
    // Master account
    // =========================
    pub master_login: u64,
    pub master_password: String,
    pub master_server: String,

    // =========================
    // Journal
    // =========================
    /// Capacity of the channel feeding the copy-log writer. Acts as a shed
    /// valve: when the writer falls behind, records are dropped rather than
    /// stalling replication.
    pub journal_queue_capacity: usize,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval_ms: env_u64("POLL_INTERVAL_MS", 200),
            max_slippage_points: env_u64("MAX_SLIPPAGE_POINTS", 10) as u32,
            magic_number: env_u64("MAGIC_NUMBER", 99_999),
            op_deadline_ms: env_u64("OP_DEADLINE_MS", 3_000),
            unreg_deadline_ms: env_u64("UNREG_DEADLINE_MS", 5_000),
            shutdown_deadline_ms: env_u64("SHUTDOWN_DEADLINE_MS", 10_000),
            master_login: env_u64("MASTER_LOGIN", 0),
            master_password: std::env::var("MASTER_PASSWORD").unwrap_or_default(),
            master_server: std::env::var("MASTER_SERVER").unwrap_or_default(),
            journal_queue_capacity: 256,
        }
    }

    /// Startup-fatal validation; the engine refuses to run on bad config.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(EngineError::InvalidConfig(format!(
                "POLL_INTERVAL_MS must be >= {MIN_POLL_INTERVAL_MS}, got {}",
                self.poll_interval_ms
            )));
        }
        if self.op_deadline_ms == 0 || self.unreg_deadline_ms == 0 || self.shutdown_deadline_ms == 0
        {
            return Err(EngineError::InvalidConfig(
                "deadlines must be non-zero".to_string(),
            ));
        }
        if self.master_login == 0 {
            return Err(EngineError::InvalidConfig(
                "MASTER_LOGIN is required".to_string(),
            ));
        }
        if self.master_server.is_empty() {
            return Err(EngineError::InvalidConfig(
                "MASTER_SERVER is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn op_deadline(&self) -> Duration {
        Duration::from_millis(self.op_deadline_ms)
    }

    pub fn unreg_deadline(&self) -> Duration {
        Duration::from_millis(self.unreg_deadline_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn master_credentials(&self) -> broker::types::Credentials {
        broker::types::Credentials {
            login: self.master_login,
            password: self.master_password.clone(),
            server: self.master_server.clone(),
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_slippage_points", &self.max_slippage_points)
            .field("magic_number", &self.magic_number)
            .field("op_deadline_ms", &self.op_deadline_ms)
            .field("unreg_deadline_ms", &self.unreg_deadline_ms)
            .field("shutdown_deadline_ms", &self.shutdown_deadline_ms)
            .field("master_login", &self.master_login)
            .field("master_password", &"<redacted>")
            .field("master_server", &self.master_server)
            .finish()
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
