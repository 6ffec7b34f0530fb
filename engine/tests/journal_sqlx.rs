//! Copy-log persistence against an isolated in-memory SQLite database.

use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use engine::journal::store_sqlx::SqlxCopyLogStore;
use engine::journal::{CopyLogRecord, CopyLogStore};

/// Isolated in-memory DB per test. The unique name prevents interference
/// during parallel execution; `cache=shared` lets all pool connections see
/// the same database.
async fn setup_pool() -> AnyPool {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let conn = format!("sqlite:file:{}?mode=memory&cache=shared", db_name);

    AnyPoolOptions::new()
        .max_connections(5)
        .connect(&conn)
        .await
        .expect("connect sqlite memory db")
}

fn mk_record(account_id: u64, event_type: &str, slave_ticket: Option<u64>) -> CopyLogRecord {
    CopyLogRecord {
        account_id,
        event_type: event_type.to_string(),
        master_ticket: 101,
        slave_ticket,
        symbol: "EURUSD".to_string(),
        volume: 0.5,
        success: slave_ticket.is_some(),
        message: if slave_ticket.is_some() {
            String::new()
        } else {
            "order rejected by broker (retcode 10006)".to_string()
        },
        latency_ms: 42,
        created_ms: 1_700_000_000_000,
    }
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let pool = setup_pool().await;
    let store = SqlxCopyLogStore::new(pool);

    store.migrate().await.unwrap();
    store.migrate().await.unwrap();
}

#[tokio::test]
async fn append_round_trips_all_fields() {
    let pool = setup_pool().await;
    let store = SqlxCopyLogStore::new(pool.clone());
    store.migrate().await.unwrap();

    store
        .append(&mk_record(1, "trade_opened", Some(9_001)))
        .await
        .unwrap();

    let row = sqlx::query(
        r#"
SELECT account_id, event_type, master_ticket, slave_ticket,
       symbol, volume, CAST(success AS INTEGER) AS success_i,
       message, latency_ms, created_ms
FROM copy_logs;
"#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(row.get::<i64, _>("account_id"), 1);
    assert_eq!(row.get::<String, _>("event_type"), "trade_opened");
    assert_eq!(row.get::<i64, _>("master_ticket"), 101);
    assert_eq!(row.get::<Option<i64>, _>("slave_ticket"), Some(9_001));
    assert_eq!(row.get::<String, _>("symbol"), "EURUSD");
    assert_eq!(row.get::<f64, _>("volume"), 0.5);
    assert_eq!(row.get::<i64, _>("success_i"), 1);
    assert_eq!(row.get::<String, _>("message"), "");
    assert_eq!(row.get::<i64, _>("latency_ms"), 42);
    assert_eq!(row.get::<i64, _>("created_ms"), 1_700_000_000_000);
}

#[tokio::test]
async fn failure_records_store_null_slave_ticket() {
    let pool = setup_pool().await;
    let store = SqlxCopyLogStore::new(pool.clone());
    store.migrate().await.unwrap();

    store.append(&mk_record(2, "error", None)).await.unwrap();

    let row = sqlx::query(
        r#"SELECT slave_ticket, CAST(success AS INTEGER) AS success_i, message FROM copy_logs;"#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(row.get::<Option<i64>, _>("slave_ticket"), None);
    assert_eq!(row.get::<i64, _>("success_i"), 0);
    assert!(row.get::<String, _>("message").contains("10006"));
}

#[tokio::test]
async fn records_accumulate_append_only() {
    let pool = setup_pool().await;
    let store = SqlxCopyLogStore::new(pool.clone());
    store.migrate().await.unwrap();

    for i in 0..5 {
        store
            .append(&mk_record(i, "trade_opened", Some(9_000 + i)))
            .await
            .unwrap();
    }

    let row = sqlx::query(r#"SELECT COUNT(*) AS n FROM copy_logs;"#)
        .fetch_one(&pool)
        .await
        .unwrap();

    assert_eq!(row.get::<i64, _>("n"), 5);
}
