use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use layer7waf_common::{Layer7Error, Severity, WafEvent};

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

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<WafEvent, Layer7Error> {
    Ok(WafEvent {
        id: row.try_get("id").map_err(db_err)?,
        proxy_id: row.try_get("proxy_id").map_err(db_err)?,
        timestamp: DateTime::from_str(&row.try_get::<String, _>("timestamp").map_err(db_err)?)
            .map_err(|e| Layer7Error::Database(format!("bad timestamp: {e}")))?,
        client_ip: row.try_get("client_ip").map_err(db_err)?,
        request_method: row.try_get("request_method").map_err(db_err)?,
        request_uri: row.try_get("request_uri").map_err(db_err)?,
        attack_type: row.try_get("attack_type").map_err(db_err)?,
        rule_id: row.try_get("rule_id").map_err(db_err)?,
        severity: severity_from_str(&row.try_get::<String, _>("severity").map_err(db_err)?),
        message: row.try_get("message").map_err(db_err)?,
        raw_log: row.try_get("raw_log").map_err(db_err)?,
        blocked: row.try_get::<i64, _>("blocked").map_err(db_err)? != 0,
        notified: row.try_get::<i64, _>("notified").map_err(db_err)? != 0,
    })
}

/// Spec §4.1 `Append`: transactional bulk insert. All-or-nothing; on failure
/// the caller (the audit ingestor) re-queues the whole batch.
pub async fn append(pool: &SqlitePool, events: &[WafEvent]) -> Result<Vec<i64>, Layer7Error> {
    if events.is_empty() {
        return Ok(Vec::new());
    }

    let mut tx = pool.begin().await.map_err(db_err)?;
    let mut ids = Vec::with_capacity(events.len());

    for event in events {
        let id = sqlx::query(
            r#"INSERT INTO waf_events
                (proxy_id, timestamp, client_ip, request_method, request_uri, attack_type,
                 rule_id, severity, message, raw_log, blocked, notified)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.proxy_id)
        .bind(event.timestamp.to_rfc3339())
        .bind(&event.client_ip)
        .bind(&event.request_method)
        .bind(&event.request_uri)
        .bind(&event.attack_type)
        .bind(&event.rule_id)
        .bind(severity_to_str(event.severity))
        .bind(&event.message)
        .bind(&event.raw_log)
        .bind(event.blocked as i64)
        .bind(event.notified as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .last_insert_rowid();
        ids.push(id);
    }

    tx.commit().await.map_err(db_err)?;
    Ok(ids)
}

/// Spec §4.1 `QueryNew`: ascending id, for the detection engine's polling
/// loop. `limit` bounds rows returned per poll (spec §4.8: 1000).
pub async fn query_new(pool: &SqlitePool, since_id: i64, limit: i64) -> Result<Vec<WafEvent>, Layer7Error> {
    let rows = sqlx::query("SELECT * FROM waf_events WHERE id > ? ORDER BY id ASC LIMIT ?")
        .bind(since_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.iter().map(row_to_event).collect()
}

#[derive(Debug, Default, Clone)]
pub struct RangeFilter {
    pub proxy_id: Option<i64>,
    pub client_ip: Option<String>,
    pub attack_type: Option<String>,
    pub severity: Option<Severity>,
    pub blocked: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Spec §4.1 `QueryRange`: filter by any combination of fields, paginated,
/// newest first.
pub async fn query_range(
    pool: &SqlitePool,
    filter: &RangeFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<WafEvent>, Layer7Error> {
    let mut sql = String::from("SELECT * FROM waf_events WHERE 1=1");
    if filter.proxy_id.is_some() {
        sql.push_str(" AND proxy_id = ?");
    }
    if filter.client_ip.is_some() {
        sql.push_str(" AND client_ip = ?");
    }
    if filter.attack_type.is_some() {
        sql.push_str(" AND attack_type = ?");
    }
    if filter.severity.is_some() {
        sql.push_str(" AND severity = ?");
    }
    if filter.blocked.is_some() {
        sql.push_str(" AND blocked = ?");
    }
    if filter.since.is_some() {
        sql.push_str(" AND timestamp >= ?");
    }
    if filter.until.is_some() {
        sql.push_str(" AND timestamp <= ?");
    }
    sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query(&sql);
    if let Some(v) = filter.proxy_id {
        query = query.bind(v);
    }
    if let Some(ref v) = filter.client_ip {
        query = query.bind(v);
    }
    if let Some(ref v) = filter.attack_type {
        query = query.bind(v);
    }
    if let Some(v) = filter.severity {
        query = query.bind(severity_to_str(v));
    }
    if let Some(v) = filter.blocked {
        query = query.bind(v as i64);
    }
    if let Some(v) = filter.since {
        query = query.bind(v.to_rfc3339());
    }
    if let Some(v) = filter.until {
        query = query.bind(v.to_rfc3339());
    }
    query = query.bind(limit).bind(offset);

    let rows = query.fetch_all(pool).await.map_err(db_err)?;
    rows.iter().map(row_to_event).collect()
}

/// Spec §4.1 `Purge`: delete rows older than `cutoff`, scheduled daily.
/// Returns rows deleted.
pub async fn purge(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64, Layer7Error> {
    let result = sqlx::query("DELETE FROM waf_events WHERE timestamp < ?")
        .bind(cutoff.to_rfc3339())
        .execute(pool)
        .await
        .map_err(db_err)?;
    sqlx::query("VACUUM").execute(pool).await.map_err(db_err)?;
    Ok(result.rows_affected())
}

/// Runs [`purge`] once per local day at `purge_hour_local`, matching the
/// "check every minute, fire once per local hour" scheduling pattern the
/// notification dispatcher uses for its daily report (spec §4.1, §4.9).
pub async fn run_purge_loop(pool: SqlitePool, retention_days: i64, purge_hour_local: u32, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    let mut last_fired_day: Option<chrono::NaiveDate> = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let local_now = chrono::Local::now();
        if local_now.hour() == purge_hour_local && last_fired_day != Some(local_now.date_naive()) {
            let cutoff = Utc::now() - chrono::Duration::days(retention_days);
            match purge(&pool, cutoff).await {
                Ok(deleted) => info!(deleted, "purged expired WAF events"),
                Err(e) => error!(error = %e, "WAF event purge sweep failed"),
            }
            last_fired_day = Some(local_now.date_naive());
        }
    }
    info!("purge loop stopped");
}

/// Window around an orphaned event's own timestamp used to find nearby
/// resolved events to vote on its `proxy_id` (spec §4.7 "±5 minutes"),
/// distinct from `scan_since` below which bounds how far back we look for
/// orphans in the first place.
const BACKFILL_MATCH_WINDOW_MINUTES: i64 = 5;

/// Spec §4.1 `Backfill`: events with `proxy_id IS NULL` timestamped at or
/// after `scan_since` adopt the most common resolved `proxy_id` seen within
/// ±5 minutes of their own timestamp for the same `client_ip`. HTTP/3
/// requests can arrive without a usable Host header, leaving `proxy_id`
/// unresolved at ingest time.
pub async fn backfill(pool: &SqlitePool, scan_since: DateTime<Utc>) -> Result<u64, Layer7Error> {
    let unresolved_rows = sqlx::query(
        "SELECT id, client_ip, timestamp FROM waf_events WHERE proxy_id IS NULL AND timestamp >= ? ORDER BY id ASC",
    )
    .bind(scan_since.to_rfc3339())
    .fetch_all(pool)
    .await
    .map_err(db_err)?;

    let match_window = chrono::Duration::minutes(BACKFILL_MATCH_WINDOW_MINUTES);
    let mut backfilled = 0u64;

    for row in unresolved_rows {
        let id: i64 = row.try_get("id").map_err(db_err)?;
        let client_ip: String = row.try_get("client_ip").map_err(db_err)?;
        let timestamp: DateTime<Utc> = DateTime::from_str(&row.try_get::<String, _>("timestamp").map_err(db_err)?)
            .map_err(|e| Layer7Error::Database(format!("bad timestamp: {e}")))?;

        let lower = (timestamp - match_window).to_rfc3339();
        let upper = (timestamp + match_window).to_rfc3339();

        let nearby = sqlx::query(
            "SELECT proxy_id FROM waf_events
             WHERE client_ip = ? AND proxy_id IS NOT NULL AND timestamp >= ? AND timestamp <= ?",
        )
        .bind(&client_ip)
        .bind(&lower)
        .bind(&upper)
        .fetch_all(pool)
        .await
        .map_err(db_err)?;

        let mut counts: HashMap<i64, u32> = HashMap::new();
        for n in &nearby {
            let proxy_id: i64 = n.try_get("proxy_id").map_err(db_err)?;
            *counts.entry(proxy_id).or_insert(0) += 1;
        }

        if let Some((&most_common, _)) = counts.iter().max_by_key(|(_, count)| **count) {
            sqlx::query("UPDATE waf_events SET proxy_id = ? WHERE id = ?")
                .bind(most_common)
                .bind(id)
                .execute(pool)
                .await
                .map_err(db_err)?;
            backfilled += 1;
        }
    }

    Ok(backfilled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open;

    fn sample_event(client_ip: &str, proxy_id: Option<i64>, at: DateTime<Utc>) -> WafEvent {
        WafEvent {
            id: None,
            proxy_id,
            timestamp: at,
            client_ip: client_ip.to_string(),
            request_method: "GET".into(),
            request_uri: "/".into(),
            attack_type: "sqli".into(),
            rule_id: "942100".into(),
            severity: Severity::Critical,
            message: "SQL Injection Attack".into(),
            raw_log: "{}".into(),
            blocked: true,
            notified: false,
        }
    }

    #[tokio::test]
    async fn append_and_query_new() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("waf-events.db")).await.unwrap();
        let now = Utc::now();

        let ids = append(&pool, &[sample_event("1.1.1.1", Some(1), now), sample_event("2.2.2.2", Some(1), now)])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let events = query_new(&pool, 0, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].id.unwrap() < events[1].id.unwrap());
    }

    #[tokio::test]
    async fn query_new_respects_since_id() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("waf-events.db")).await.unwrap();
        let now = Utc::now();

        let ids = append(&pool, &[sample_event("1.1.1.1", Some(1), now), sample_event("2.2.2.2", Some(1), now)])
            .await
            .unwrap();

        let events = query_new(&pool, ids[0], 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].client_ip, "2.2.2.2");
    }

    #[tokio::test]
    async fn query_range_filters_by_attack_type_and_ip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("waf-events.db")).await.unwrap();
        let now = Utc::now();

        let mut xss_event = sample_event("3.3.3.3", Some(1), now);
        xss_event.attack_type = "xss".into();
        append(&pool, &[sample_event("1.1.1.1", Some(1), now), xss_event]).await.unwrap();

        let filter = RangeFilter {
            attack_type: Some("xss".into()),
            ..Default::default()
        };
        let events = query_range(&pool, &filter, 10, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].client_ip, "3.3.3.3");
    }

    #[tokio::test]
    async fn purge_removes_rows_before_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("waf-events.db")).await.unwrap();
        let now = Utc::now();
        let old = now - chrono::Duration::days(100);

        append(&pool, &[sample_event("1.1.1.1", Some(1), old), sample_event("2.2.2.2", Some(1), now)])
            .await
            .unwrap();

        let deleted = purge(&pool, now - chrono::Duration::days(90)).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = query_new(&pool, 0, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].client_ip, "2.2.2.2");
    }

    #[tokio::test]
    async fn backfill_adopts_most_common_nearby_proxy_id() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("waf-events.db")).await.unwrap();
        let now = Utc::now();

        append(
            &pool,
            &[
                sample_event("9.9.9.9", Some(7), now),
                sample_event("9.9.9.9", Some(7), now + chrono::Duration::seconds(30)),
                sample_event("9.9.9.9", None, now + chrono::Duration::minutes(1)),
            ],
        )
        .await
        .unwrap();

        let backfilled = backfill(&pool, now - chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(backfilled, 1);

        let events = query_new(&pool, 0, 10).await.unwrap();
        assert!(events.iter().all(|e| e.proxy_id == Some(7)));
    }

    #[tokio::test]
    async fn backfill_leaves_events_with_no_nearby_resolved_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("waf-events.db")).await.unwrap();
        let now = Utc::now();

        append(&pool, &[sample_event("5.5.5.5", None, now)]).await.unwrap();

        let backfilled = backfill(&pool, now - chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(backfilled, 0);
    }

    #[tokio::test]
    async fn backfill_ignores_orphans_older_than_scan_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("waf-events.db")).await.unwrap();
        let now = Utc::now();
        let old = now - chrono::Duration::minutes(30);

        append(
            &pool,
            &[sample_event("4.4.4.4", Some(2), old), sample_event("4.4.4.4", None, old)],
        )
        .await
        .unwrap();

        let backfilled = backfill(&pool, now - chrono::Duration::minutes(10)).await.unwrap();
        assert_eq!(backfilled, 0, "orphan predates the scan cutoff and must be left alone");
    }
}
