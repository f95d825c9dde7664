use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Sent,
    Queued,
    Retried,
    Dropped,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::Queued => "queued",
            DeliveryOutcome::Retried => "retried",
            DeliveryOutcome::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub destination: String,
    pub outcome: String,
    pub count: i64,
    pub updated_at: DateTime<Utc>,
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = [r#"CREATE TABLE IF NOT EXISTS delivery_metrics (
            destination TEXT NOT NULL,
            outcome TEXT NOT NULL,
            count BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            PRIMARY KEY (destination, outcome)
        )"#];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }
    Ok(())
}

pub async fn increment_metric(
    pool: &AnyPool,
    kind: DbKind,
    destination: &str,
    outcome: DeliveryOutcome,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO delivery_metrics (destination, outcome, count, updated_at)
           VALUES (?, ?, 1, ?)
           ON CONFLICT(destination, outcome) DO UPDATE SET
               count = delivery_metrics.count + 1,
               updated_at = excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(destination)
        .bind(outcome.as_str())
        .bind(at.timestamp())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_metrics(pool: &AnyPool, kind: DbKind) -> Result<Vec<MetricRecord>> {
    let sql = rewrite_sql(
        "SELECT destination, outcome, count, updated_at FROM delivery_metrics ORDER BY destination, outcome",
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let updated_at: i64 = row.try_get("updated_at")?;
        out.push(MetricRecord {
            destination: row.try_get("destination")?,
            outcome: row.try_get("outcome")?,
            count: row.try_get("count")?,
            updated_at: i64_to_datetime(updated_at),
        });
    }
    Ok(out)
}

/// Fire-and-forget metrics writer shared by the pipeline and the retry queue.
#[derive(Clone)]
pub struct MetricsRecorder {
    pool: AnyPool,
    kind: DbKind,
}

impl MetricsRecorder {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }

    pub async fn record(&self, destination: &str, outcome: DeliveryOutcome) {
        if let Err(err) =
            increment_metric(&self.pool, self.kind, destination, outcome, Utc::now()).await
        {
            warn!(destination, outcome = outcome.as_str(), error = %err, "failed to persist metric");
        }
    }

    pub async fn snapshot(&self) -> Result<Vec<MetricRecord>> {
        list_metrics(&self.pool, self.kind).await
    }
}
