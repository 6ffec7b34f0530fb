//! Append-only copy log.
//!
//! Every per-follower replication outcome produces exactly one record.
//! Records flow through a bounded channel into a dedicated writer task so a
//! slow or failing store can never stall replication: a full queue or a
//! failed write is logged and the record is dropped.

pub mod schema;
pub mod store_sqlx;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use common::logger::warn_if_slow;

/// One replication outcome for one follower account.
#[derive(Debug, Clone)]
pub struct CopyLogRecord {
    pub account_id: u64,
    /// `trade_opened`, `trade_closed`, `trade_modified` or `error`.
    pub event_type: String,
    pub master_ticket: u64,
    pub slave_ticket: Option<u64>,
    pub symbol: String,
    pub volume: f64,
    pub success: bool,
    pub message: String,
    pub latency_ms: u64,
    pub created_ms: u64,
}

/// Persistence seam for copy-log records.
#[async_trait]
pub trait CopyLogStore: Send + Sync {
    async fn append(&self, record: &CopyLogRecord) -> anyhow::Result<()>;
}

/// Cloneable producer handle used by follower workers.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<CopyLogRecord>,
}

impl Journal {
    /// Record an outcome without ever blocking the caller.
    pub fn record(&self, record: CopyLogRecord) {
        if self.tx.try_send(record).is_err() {
            warn!("copy-log queue full or closed; record dropped");
        }
    }
}

/// Spawn the writer task draining records into `store`.
///
/// The task ends once every `Journal` clone is dropped and the backlog is
/// flushed.
pub fn spawn_writer(
    store: Arc<dyn CopyLogStore>,
    capacity: usize,
) -> (Journal, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<CopyLogRecord>(capacity.max(16));

    let join = tokio::spawn(async move {
        info!("copy-log writer started");

        while let Some(record) = rx.recv().await {
            let written = warn_if_slow("copy_log_append", Duration::from_millis(100), async {
                store.append(&record).await
            })
            .await;

            if let Err(e) = written {
                // Persistence is observability only; never bubble up.
                warn!(
                    account_id = record.account_id,
                    event_type = %record.event_type,
                    error = %e,
                    "copy-log append failed"
                );
            } else {
                debug!(
                    account_id = record.account_id,
                    event_type = %record.event_type,
                    master_ticket = record.master_ticket,
                    "copy-log record written"
                );
            }
        }

        info!("copy-log writer stopped");
    });

    (Journal { tx }, join)
}

/// Narrowing helper at the journal–persistence boundary; overflow is made
/// explicit instead of wrapping silently.
pub fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    if v > i64::MAX as u64 {
        anyhow::bail!("u64 too large for i64: {v}");
    }
    Ok(v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct MemoryStore {
        rows: Mutex<Vec<CopyLogRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl CopyLogStore for MemoryStore {
        async fn append(&self, record: &CopyLogRecord) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("store offline");
            }
            self.rows.lock().push(record.clone());
            Ok(())
        }
    }

    fn mk_record(account_id: u64) -> CopyLogRecord {
        CopyLogRecord {
            account_id,
            event_type: "trade_opened".to_string(),
            master_ticket: 101,
            slave_ticket: Some(9001),
            symbol: "EURUSD".to_string(),
            volume: 0.5,
            success: true,
            message: String::new(),
            latency_ms: 12,
            created_ms: 0,
        }
    }

    #[tokio::test]
    async fn records_drain_into_store() {
        let store = Arc::new(MemoryStore {
            rows: Mutex::new(vec![]),
            fail: false,
        });
        let (journal, join) = spawn_writer(store.clone(), 16);

        journal.record(mk_record(1));
        journal.record(mk_record(2));
        drop(journal);

        join.await.unwrap();

        let rows = store.rows.lock();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].account_id, 1);
    }

    #[tokio::test]
    async fn store_failure_is_swallowed() {
        let store = Arc::new(MemoryStore {
            rows: Mutex::new(vec![]),
            fail: true,
        });
        let (journal, join) = spawn_writer(store, 16);

        journal.record(mk_record(1));
        drop(journal);

        // Writer exits cleanly despite every append failing.
        join.await.unwrap();
    }

    #[test]
    fn u64_narrowing_is_checked() {
        assert_eq!(u64_to_i64(42).unwrap(), 42);
        assert!(u64_to_i64(u64::MAX).is_err());
    }
}
