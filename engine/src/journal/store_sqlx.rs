use anyhow::Context;
use async_trait::async_trait;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use uuid::Uuid;

use crate::journal::{CopyLogRecord, CopyLogStore, schema, u64_to_i64};

/// SQLx-backed copy-log store. Responsible only for persistence and row
/// mapping; queueing and failure shedding happen in the writer task.
pub struct SqlxCopyLogStore {
    pool: AnyPool,
}

impl SqlxCopyLogStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("failed to connect copy-log store")?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate(&self.pool).await
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

#[async_trait]
impl CopyLogStore for SqlxCopyLogStore {
    async fn append(&self, record: &CopyLogRecord) -> anyhow::Result<()> {
        let slave_ticket = record.slave_ticket.map(u64_to_i64).transpose()?;

        sqlx::query(
            r#"
INSERT INTO copy_logs (
  id, account_id, event_type, master_ticket, slave_ticket,
  symbol, volume, success, message, latency_ms, created_ms
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(u64_to_i64(record.account_id)?)
        .bind(&record.event_type)
        .bind(u64_to_i64(record.master_ticket)?)
        .bind(slave_ticket)
        .bind(&record.symbol)
        .bind(record.volume)
        .bind(record.success)
        .bind(&record.message)
        .bind(u64_to_i64(record.latency_ms)?)
        .bind(u64_to_i64(record.created_ms)?)
        .execute(&self.pool)
        .await
        .context("copy-log insert failed")?;

        Ok(())
    }
}
