use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use layer7waf_common::Layer7Error;

use crate::types::{NotificationRecord, NotificationStatus};

fn db_err(e: sqlx::Error) -> Layer7Error {
    Layer7Error::Database(e.to_string())
}

fn status_to_str(s: NotificationStatus) -> &'static str {
    match s {
        NotificationStatus::Sent => "sent",
        NotificationStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> NotificationStatus {
    match s {
        "failed" => NotificationStatus::Failed,
        _ => NotificationStatus::Sent,
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<NotificationRecord, Layer7Error> {
    Ok(NotificationRecord {
        id: row.try_get("id").map_err(db_err)?,
        channel: row.try_get("channel").map_err(db_err)?,
        event_type: row.try_get("event_type").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        body: row.try_get("body").map_err(db_err)?,
        severity: row.try_get("severity").map_err(db_err)?,
        status: status_from_str(&row.try_get::<String, _>("status").map_err(db_err)?),
        sent_at: DateTime::from_str(&row.try_get::<String, _>("sent_at").map_err(db_err)?)
            .map_err(|e| Layer7Error::Database(format!("bad timestamp: {e}")))?,
        error: row.try_get("error").map_err(db_err)?,
    })
}

pub struct NewNotificationRecord {
    pub channel: String,
    pub event_type: String,
    pub title: String,
    pub body: String,
    pub severity: String,
    pub status: NotificationStatus,
    pub error: Option<String>,
}

/// Audit trail entry for a dispatched (or failed) notification (spec §4.9).
pub async fn record(
    pool: &SqlitePool,
    new: NewNotificationRecord,
    sent_at: DateTime<Utc>,
) -> Result<NotificationRecord, Layer7Error> {
    let id = sqlx::query(
        r#"INSERT INTO notification_records
            (channel, event_type, title, body, severity, status, sent_at, error)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&new.channel)
    .bind(&new.event_type)
    .bind(&new.title)
    .bind(&new.body)
    .bind(&new.severity)
    .bind(status_to_str(new.status))
    .bind(sent_at.to_rfc3339())
    .bind(&new.error)
    .execute(pool)
    .await
    .map_err(db_err)?
    .last_insert_rowid();

    get(pool, id).await?.ok_or_else(|| Layer7Error::Database("notification record vanished after insert".into()))
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<NotificationRecord>, Layer7Error> {
    let row = sqlx::query("SELECT * FROM notification_records WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    row.as_ref().map(row_to_record).transpose()
}

/// Records within a time range, newest first, for the admin API and the
/// daily report (spec §4.9).
pub async fn list_since(pool: &SqlitePool, since: DateTime<Utc>, limit: i64) -> Result<Vec<NotificationRecord>, Layer7Error> {
    let rows = sqlx::query("SELECT * FROM notification_records WHERE sent_at >= ? ORDER BY sent_at DESC LIMIT ?")
        .bind(since.to_rfc3339())
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.iter().map(row_to_record).collect()
}
