//! User-facing notification sink.
//!
//! The engine only knows a narrow `Notifier` interface injected at
//! construction; transport (WebSocket hub, message bus, CLI) lives outside.
//! Message payloads are typed here and serialized into the wire shape
//! `{type, account_id, ts, ...fields}`.

use std::time::Duration;

use async_trait::async_trait;
use broker::types::Side;
use serde::Serialize;
use tracing::warn;

/// Write-only sink for per-user replication events. Implementations must be
/// safe to share across follower workers.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_to_user(&self, user_id: &str, msg: serde_json::Value) -> anyhow::Result<()>;
}

/// Payload of one user-facing event; the `type` tag matches the wire name.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserEvent {
    TradeOpened {
        master_ticket: u64,
        slave_ticket: u64,
        symbol: String,
        volume: f64,
        side: Side,
    },
    TradeClosed {
        master_ticket: u64,
        slave_ticket: u64,
        symbol: String,
    },
    TradeModified {
        master_ticket: u64,
        slave_ticket: u64,
        sl: f64,
        tp: f64,
    },
    ReplicationError {
        #[serde(skip_serializing_if = "Option::is_none")]
        master_ticket: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u32>,
    },
    AuthFailed {
        login: u64,
    },
}

impl UserEvent {
    /// Wrap the payload into the wire envelope for `account_id`.
    pub fn into_message(self, account_id: u64) -> serde_json::Value {
        let mut msg = serde_json::to_value(&self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = msg.as_object_mut() {
            obj.insert("account_id".to_string(), account_id.into());
            obj.insert(
                "ts".to_string(),
                chrono::Utc::now().to_rfc3339().into(),
            );
        }
        msg
    }
}

/// Deliver one event, bounded in time. Delivery failures are logged and
/// swallowed; notifications never affect replication.
pub async fn notify_user(
    notifier: &dyn Notifier,
    deadline: Duration,
    user_id: u64,
    account_id: u64,
    event: UserEvent,
) {
    let msg = event.into_message(account_id);
    let user = user_id.to_string();

    match tokio::time::timeout(deadline, notifier.send_to_user(&user, msg)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(user_id, account_id, error = %e, "notification delivery failed");
        }
        Err(_) => {
            warn!(user_id, account_id, "notification delivery timed out");
        }
    }
}
