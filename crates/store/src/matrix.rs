use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use layer7waf_common::{Layer7Error, Severity};

use crate::types::MatrixRule;

fn db_err(e: sqlx::Error) -> Layer7Error {
    Layer7Error::Database(e.to_string())
}

fn severity_to_str(s: Severity) -> &'static str {
    match s {
        Severity::Notice => "NOTICE",
        Severity::Warning => "WARNING",
        Severity::Error => "ERROR",
        Severity::Critical => "CRITICAL",
    }
}

fn severity_from_str(s: &str) -> Severity {
    match s {
        "CRITICAL" => Severity::Critical,
        "ERROR" => Severity::Error,
        "NOTICE" => Severity::Notice,
        _ => Severity::Warning,
    }
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<MatrixRule, Layer7Error> {
    let last_triggered: Option<String> = row.try_get("last_triggered").map_err(db_err)?;
    Ok(MatrixRule {
        id: row.try_get("id").map_err(db_err)?,
        severity_level: severity_from_str(&row.try_get::<String, _>("severity_level").map_err(db_err)?),
        count_threshold: row.try_get("count_threshold").map_err(db_err)?,
        time_window_s: row.try_get("time_window_s").map_err(db_err)?,
        notification_delay_s: row.try_get("notification_delay_s").map_err(db_err)?,
        last_triggered: last_triggered
            .map(|s| DateTime::from_str(&s))
            .transpose()
            .map_err(|e| Layer7Error::Database(format!("bad timestamp: {e}")))?,
    })
}

pub struct NewMatrixRule {
    pub severity_level: Severity,
    pub count_threshold: i64,
    pub time_window_s: i64,
    pub notification_delay_s: i64,
}

pub async fn create(pool: &SqlitePool, new: NewMatrixRule) -> Result<MatrixRule, Layer7Error> {
    let id = sqlx::query(
        "INSERT INTO matrix_rules (severity_level, count_threshold, time_window_s, notification_delay_s)
         VALUES (?, ?, ?, ?)",
    )
    .bind(severity_to_str(new.severity_level))
    .bind(new.count_threshold)
    .bind(new.time_window_s)
    .bind(new.notification_delay_s)
    .execute(pool)
    .await
    .map_err(db_err)?
    .last_insert_rowid();

    get(pool, id).await?.ok_or_else(|| Layer7Error::Database("matrix rule vanished after insert".into()))
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<MatrixRule>, Layer7Error> {
    let row = sqlx::query("SELECT * FROM matrix_rules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    row.as_ref().map(row_to_rule).transpose()
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<MatrixRule>, Layer7Error> {
    let rows = sqlx::query("SELECT * FROM matrix_rules").fetch_all(pool).await.map_err(db_err)?;
    rows.iter().map(row_to_rule).collect()
}

/// Spec §4.9: a matrix rule fires only once per `notification_delay`; this
/// records that a firing just happened.
pub async fn mark_triggered(pool: &SqlitePool, id: i64, at: DateTime<Utc>) -> Result<(), Layer7Error> {
    sqlx::query("UPDATE matrix_rules SET last_triggered = ? WHERE id = ?")
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open;

    #[tokio::test]
    async fn create_and_mark_triggered() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();
        let now = Utc::now();

        let rule = create(
            &pool,
            NewMatrixRule {
                severity_level: Severity::Critical,
                count_threshold: 10,
                time_window_s: 300,
                notification_delay_s: 600,
            },
        )
        .await
        .unwrap();
        assert!(rule.last_triggered.is_none());

        mark_triggered(&pool, rule.id, now).await.unwrap();
        let reloaded = get(&pool, rule.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_triggered.unwrap(), now);
    }

    #[tokio::test]
    async fn list_all_returns_every_rule() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();

        create(
            &pool,
            NewMatrixRule {
                severity_level: Severity::Warning,
                count_threshold: 5,
                time_window_s: 60,
                notification_delay_s: 120,
            },
        )
        .await
        .unwrap();

        assert_eq!(list_all(&pool).await.unwrap().len(), 1);
    }
}
