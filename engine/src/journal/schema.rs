use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS copy_logs (
  id TEXT PRIMARY KEY,
  account_id BIGINT NOT NULL,
  event_type TEXT NOT NULL,
  master_ticket BIGINT NOT NULL,
  slave_ticket BIGINT,
  symbol TEXT NOT NULL,
  volume DOUBLE PRECISION NOT NULL,
  success BOOLEAN NOT NULL,
  message TEXT NOT NULL,
  latency_ms BIGINT NOT NULL,
  created_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_copy_logs_account ON copy_logs(account_id);"#)
        .execute(pool)
        .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_copy_logs_created ON copy_logs(created_ms);"#)
        .execute(pool)
        .await?;

    Ok(())
}
