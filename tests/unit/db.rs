use channel_relay::db::{
    db_kind_from_url, increment_metric, init_db, list_metrics, rewrite_sql, DbKind,
    DeliveryOutcome, MetricsRecorder,
};
use chrono::{TimeZone, Utc};
use sqlx::AnyPool;

#[test]
fn test_db_kind_from_url_sqlite() {
    assert_eq!(db_kind_from_url("sqlite://test.db"), DbKind::Sqlite);
    assert_eq!(db_kind_from_url("SQLite://test.db"), DbKind::Sqlite);
}

#[test]
fn test_db_kind_from_url_postgres() {
    assert_eq!(
        db_kind_from_url("postgres://localhost/testdb"),
        DbKind::Postgres
    );
    assert_eq!(
        db_kind_from_url("postgresql://localhost/testdb"),
        DbKind::Postgres
    );
}

#[test]
fn test_db_kind_from_url_default_sqlite() {
    assert_eq!(db_kind_from_url("mysql://localhost/testdb"), DbKind::Sqlite);
}

#[test]
fn test_rewrite_sql_sqlite() {
    let sql = "SELECT * FROM delivery_metrics WHERE destination = ? AND outcome = ?";
    assert_eq!(rewrite_sql(sql, DbKind::Sqlite).as_ref(), sql);
}

#[test]
fn test_rewrite_sql_postgres() {
    let sql = "SELECT * FROM delivery_metrics WHERE destination = ? AND outcome = ?";
    assert_eq!(
        rewrite_sql(sql, DbKind::Postgres).as_ref(),
        "SELECT * FROM delivery_metrics WHERE destination = $1 AND outcome = $2"
    );
}

#[test]
fn test_rewrite_sql_postgres_no_placeholders() {
    let sql = "SELECT * FROM delivery_metrics";
    assert_eq!(rewrite_sql(sql, DbKind::Postgres).as_ref(), sql);
}

#[test]
fn test_outcome_serializes_lowercase() {
    assert_eq!(
        serde_json::to_value(DeliveryOutcome::Retried).unwrap(),
        serde_json::json!("retried")
    );
}

async fn sqlite_pool(dir: &tempfile::TempDir) -> AnyPool {
    sqlx::any::install_default_drivers();
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("metrics.sqlite").to_string_lossy()
    );
    let pool = AnyPool::connect(&url).await.unwrap();
    init_db(&pool, DbKind::Sqlite).await.unwrap();
    pool
}

#[tokio::test]
async fn test_init_db_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir).await;
    init_db(&pool, DbKind::Sqlite).await.unwrap();
    assert!(list_metrics(&pool, DbKind::Sqlite).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_increment_metric_upserts() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir).await;
    let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let later = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

    increment_metric(&pool, DbKind::Sqlite, "alerts", DeliveryOutcome::Sent, first)
        .await
        .unwrap();
    increment_metric(&pool, DbKind::Sqlite, "alerts", DeliveryOutcome::Sent, later)
        .await
        .unwrap();
    increment_metric(&pool, DbKind::Sqlite, "alerts", DeliveryOutcome::Queued, first)
        .await
        .unwrap();

    let rows = list_metrics(&pool, DbKind::Sqlite).await.unwrap();
    assert_eq!(rows.len(), 2);
    let queued = &rows[0];
    assert_eq!(queued.outcome, "queued");
    assert_eq!(queued.count, 1);
    let sent = &rows[1];
    assert_eq!(sent.destination, "alerts");
    assert_eq!(sent.outcome, "sent");
    assert_eq!(sent.count, 2);
    assert_eq!(sent.updated_at, later);
}

#[tokio::test]
async fn test_metrics_recorder_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir).await;
    let recorder = MetricsRecorder::new(pool, DbKind::Sqlite);

    recorder.record("ops", DeliveryOutcome::Dropped).await;
    recorder.record("alerts", DeliveryOutcome::Retried).await;

    let rows = recorder.snapshot().await.unwrap();
    let names: Vec<(&str, &str)> = rows
        .iter()
        .map(|r| (r.destination.as_str(), r.outcome.as_str()))
        .collect();
    assert_eq!(names, vec![("alerts", "retried"), ("ops", "dropped")]);
}
