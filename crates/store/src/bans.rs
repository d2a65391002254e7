use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use layer7waf_common::{BanSeverity, Layer7Error};

use crate::types::{Ban, IntegrationNotified, NewBan};

fn severity_to_str(s: BanSeverity) -> &'static str {
    match s {
        BanSeverity::Low => "LOW",
        BanSeverity::Medium => "MEDIUM",
        BanSeverity::High => "HIGH",
        BanSeverity::Critical => "CRITICAL",
    }
}

fn severity_from_str(s: &str) -> BanSeverity {
    match s {
        "LOW" => BanSeverity::Low,
        "HIGH" => BanSeverity::High,
        "CRITICAL" => BanSeverity::Critical,
        _ => BanSeverity::Medium,
    }
}

fn row_to_ban(row: &sqlx::sqlite::SqliteRow) -> Result<Ban, Layer7Error> {
    let sample_events_raw: String = row.try_get("sample_events").unwrap_or_default();
    let integrations_raw: String = row.try_get("integrations_notified").unwrap_or_default();

    Ok(Ban {
        id: row.try_get("id").map_err(db_err)?,
        ip_address: row.try_get("ip_address").map_err(db_err)?,
        reason: row.try_get("reason").map_err(db_err)?,
        attack_type: row.try_get("attack_type").map_err(db_err)?,
        event_count: row.try_get("event_count").map_err(db_err)?,
        severity: severity_from_str(&row.try_get::<String, _>("severity").map_err(db_err)?),
        banned_at: parse_ts(&row.try_get::<String, _>("banned_at").map_err(db_err)?)?,
        expires_at: parse_opt_ts(row.try_get("expires_at").map_err(db_err)?)?,
        unbanned_at: parse_opt_ts(row.try_get("unbanned_at").map_err(db_err)?)?,
        unbanned_by: row.try_get("unbanned_by").map_err(db_err)?,
        auto_banned: row.try_get::<i64, _>("auto_banned").map_err(db_err)? != 0,
        banned_by: row.try_get("banned_by").map_err(db_err)?,
        proxy_id: row.try_get("proxy_id").map_err(db_err)?,
        detection_rule_id: row.try_get("detection_rule_id").map_err(db_err)?,
        sample_events: serde_json::from_str(&sample_events_raw).unwrap_or_default(),
        integrations_notified: serde_json::from_str(&integrations_raw).unwrap_or_default(),
    })
}

fn db_err(e: sqlx::Error) -> Layer7Error {
    Layer7Error::Database(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, Layer7Error> {
    DateTime::from_str(s).map_err(|e| Layer7Error::Database(format!("bad timestamp {s}: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, Layer7Error> {
    s.map(|s| parse_ts(&s)).transpose()
}

/// Insert a new ban row. Callers (the orchestrator) must already have
/// checked the whitelist and the "already banned" precondition — this
/// function performs no policy checks of its own.
pub async fn create(pool: &SqlitePool, new: NewBan, banned_at: DateTime<Utc>) -> Result<Ban, Layer7Error> {
    let expires_at = new.duration_s.map(|d| banned_at + chrono::Duration::seconds(d));
    let sample_events = serde_json::to_string(&new.sample_events).unwrap();

    let id = sqlx::query(
        r#"INSERT INTO bans
            (ip_address, reason, attack_type, event_count, severity, banned_at, expires_at,
             auto_banned, banned_by, proxy_id, detection_rule_id, sample_events, integrations_notified)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '[]')"#,
    )
    .bind(&new.ip_address)
    .bind(&new.reason)
    .bind(&new.attack_type)
    .bind(new.event_count)
    .bind(severity_to_str(new.severity))
    .bind(banned_at.to_rfc3339())
    .bind(expires_at.map(|e| e.to_rfc3339()))
    .bind(new.auto_banned as i64)
    .bind(&new.banned_by)
    .bind(new.proxy_id)
    .bind(new.detection_rule_id)
    .bind(&sample_events)
    .execute(pool)
    .await
    .map_err(db_err)?
    .last_insert_rowid();

    get(pool, id).await?.ok_or_else(|| Layer7Error::Database("ban vanished after insert".into()))
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<Ban>, Layer7Error> {
    let row = sqlx::query("SELECT * FROM bans WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    row.as_ref().map(row_to_ban).transpose()
}

/// Spec §3 invariant (a): at most one active ban per IP. This query returns
/// that row if it exists.
pub async fn find_active_by_ip(pool: &SqlitePool, ip: &str, now: DateTime<Utc>) -> Result<Option<Ban>, Layer7Error> {
    let row = sqlx::query(
        "SELECT * FROM bans WHERE ip_address = ? AND unbanned_at IS NULL
         AND (expires_at IS NULL OR expires_at > ?)
         ORDER BY id DESC LIMIT 1",
    )
    .bind(ip)
    .bind(now.to_rfc3339())
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;
    row.as_ref().map(row_to_ban).transpose()
}

pub async fn list_active(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Ban>, Layer7Error> {
    let rows = sqlx::query(
        "SELECT * FROM bans WHERE unbanned_at IS NULL AND (expires_at IS NULL OR expires_at > ?)",
    )
    .bind(now.to_rfc3339())
    .fetch_all(pool)
    .await
    .map_err(db_err)?;
    rows.iter().map(row_to_ban).collect()
}

/// Bans whose `expires_at` has passed but are not yet marked unbanned
/// (spec §4.5 `ExpirySweep`, §4.6 step 5).
pub async fn list_expired(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Ban>, Layer7Error> {
    let rows = sqlx::query(
        "SELECT * FROM bans WHERE unbanned_at IS NULL AND expires_at IS NOT NULL AND expires_at <= ?",
    )
    .bind(now.to_rfc3339())
    .fetch_all(pool)
    .await
    .map_err(db_err)?;
    rows.iter().map(row_to_ban).collect()
}

pub async fn set_unbanned(
    pool: &SqlitePool,
    id: i64,
    unbanned_at: DateTime<Utc>,
    unbanned_by: Option<&str>,
) -> Result<(), Layer7Error> {
    sqlx::query("UPDATE bans SET unbanned_at = ?, unbanned_by = ? WHERE id = ? AND unbanned_at IS NULL")
        .bind(unbanned_at.to_rfc3339())
        .bind(unbanned_by)
        .bind(id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub async fn make_permanent(pool: &SqlitePool, id: i64) -> Result<(), Layer7Error> {
    sqlx::query("UPDATE bans SET expires_at = NULL WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Append an entry to a Ban's `integrations_notified` list. Idempotent per
/// integration: re-recording the same integration replaces its entry rather
/// than duplicating it.
pub async fn record_integration_notified(
    pool: &SqlitePool,
    id: i64,
    entry: IntegrationNotified,
) -> Result<(), Layer7Error> {
    let ban = get(pool, id).await?.ok_or_else(|| Layer7Error::Database(format!("ban {id} not found")))?;
    let mut list: Vec<IntegrationNotified> = ban
        .integrations_notified
        .into_iter()
        .filter(|e| e.integration_id != entry.integration_id)
        .collect();
    list.push(entry);
    let encoded = serde_json::to_string(&list).unwrap();

    sqlx::query("UPDATE bans SET integrations_notified = ? WHERE id = ?")
        .bind(encoded)
        .bind(id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[derive(Debug, Default, serde::Serialize)]
pub struct BanStatistics {
    pub total_active: i64,
    pub auto_banned: i64,
    pub manual_banned: i64,
    pub permanent: i64,
    pub temporary: i64,
    pub last_24h: i64,
    pub top_attack_types: Vec<(String, i64)>,
}

/// Spec §4.5 `GetStatistics`.
pub async fn statistics(pool: &SqlitePool, now: DateTime<Utc>) -> Result<BanStatistics, Layer7Error> {
    let active = list_active(pool, now).await?;
    let mut stats = BanStatistics {
        total_active: active.len() as i64,
        ..Default::default()
    };

    let day_ago = now - chrono::Duration::hours(24);
    let mut attack_counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();

    for ban in &active {
        if ban.auto_banned {
            stats.auto_banned += 1;
        } else {
            stats.manual_banned += 1;
        }
        if ban.expires_at.is_none() {
            stats.permanent += 1;
        } else {
            stats.temporary += 1;
        }
        if ban.banned_at >= day_ago {
            stats.last_24h += 1;
        }
        if let Some(ref attack_type) = ban.attack_type {
            *attack_counts.entry(attack_type.clone()).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, i64)> = attack_counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.truncate(5);
    stats.top_attack_types = ranked;

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open;

    fn sample_ban(ip: &str) -> NewBan {
        NewBan {
            ip_address: ip.to_string(),
            reason: "test ban".into(),
            attack_type: Some("sqli".into()),
            event_count: 5,
            severity: BanSeverity::High,
            duration_s: Some(3600),
            auto_banned: true,
            banned_by: None,
            proxy_id: None,
            detection_rule_id: None,
            sample_events: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn create_and_find_active() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();
        let now = Utc::now();

        let ban = create(&pool, sample_ban("203.0.113.7"), now).await.unwrap();
        assert!(ban.is_active(now));
        assert_eq!(ban.expires_at.unwrap(), ban.banned_at + chrono::Duration::seconds(3600));

        let found = find_active_by_ip(&pool, "203.0.113.7", now).await.unwrap();
        assert_eq!(found.unwrap().id, ban.id);
    }

    #[tokio::test]
    async fn unban_clears_active_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();
        let now = Utc::now();

        let ban = create(&pool, sample_ban("198.51.100.1"), now).await.unwrap();
        set_unbanned(&pool, ban.id, now, Some("admin")).await.unwrap();

        let found = find_active_by_ip(&pool, "198.51.100.1", now).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn make_permanent_clears_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();
        let now = Utc::now();

        let ban = create(&pool, sample_ban("198.51.100.2"), now).await.unwrap();
        make_permanent(&pool, ban.id).await.unwrap();

        let reloaded = get(&pool, ban.id).await.unwrap().unwrap();
        assert!(reloaded.expires_at.is_none());
    }

    #[tokio::test]
    async fn record_integration_notified_is_idempotent_per_integration() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();
        let now = Utc::now();

        let ban = create(&pool, sample_ban("198.51.100.3"), now).await.unwrap();
        record_integration_notified(
            &pool,
            ban.id,
            IntegrationNotified {
                integration_id: 1,
                provider_ban_id: Some("a1".into()),
                notified_at: now,
            },
        )
        .await
        .unwrap();
        record_integration_notified(
            &pool,
            ban.id,
            IntegrationNotified {
                integration_id: 1,
                provider_ban_id: Some("a2".into()),
                notified_at: now,
            },
        )
        .await
        .unwrap();

        let reloaded = get(&pool, ban.id).await.unwrap().unwrap();
        assert_eq!(reloaded.integrations_notified.len(), 1);
        assert_eq!(reloaded.integrations_notified[0].provider_ban_id.as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn list_expired_finds_only_past_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();
        let now = Utc::now();

        let mut expiring_ban = sample_ban("203.0.113.8");
        expiring_ban.duration_s = Some(-5); // already expired relative to `now`
        create(&pool, expiring_ban, now).await.unwrap();

        let mut future_ban = sample_ban("203.0.113.9");
        future_ban.duration_s = Some(3600);
        create(&pool, future_ban, now).await.unwrap();

        let expired = list_expired(&pool, now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].ip_address, "203.0.113.8");
    }

    #[tokio::test]
    async fn statistics_aggregate_active_bans() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();
        let now = Utc::now();

        create(&pool, sample_ban("1.1.1.1"), now).await.unwrap();
        let mut manual = sample_ban("2.2.2.2");
        manual.auto_banned = false;
        manual.duration_s = None;
        create(&pool, manual, now).await.unwrap();

        let stats = statistics(&pool, now).await.unwrap();
        assert_eq!(stats.total_active, 2);
        assert_eq!(stats.auto_banned, 1);
        assert_eq!(stats.manual_banned, 1);
        assert_eq!(stats.permanent, 1);
        assert_eq!(stats.temporary, 1);
    }
}
