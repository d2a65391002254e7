use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use layer7waf_common::Layer7Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT NOT NULL,
    reason TEXT NOT NULL,
    attack_type TEXT,
    event_count INTEGER NOT NULL DEFAULT 0,
    severity TEXT NOT NULL,
    banned_at TEXT NOT NULL,
    expires_at TEXT,
    unbanned_at TEXT,
    unbanned_by TEXT,
    auto_banned INTEGER NOT NULL DEFAULT 0,
    banned_by TEXT,
    proxy_id INTEGER,
    detection_rule_id INTEGER,
    sample_events TEXT NOT NULL DEFAULT '[]',
    integrations_notified TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_bans_ip ON bans(ip_address);
CREATE INDEX IF NOT EXISTS idx_bans_active ON bans(unbanned_at, expires_at);

CREATE TABLE IF NOT EXISTS whitelist_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT,
    ip_range TEXT,
    entry_type TEXT NOT NULL,
    priority INTEGER NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    added_by TEXT
);

CREATE TABLE IF NOT EXISTS integrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    provider TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    credentials_encrypted TEXT NOT NULL DEFAULT '',
    scope TEXT
);

CREATE TABLE IF NOT EXISTS detection_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 100,
    time_window_s INTEGER NOT NULL,
    threshold INTEGER NOT NULL,
    attack_types TEXT NOT NULL DEFAULT '[]',
    severity_filter TEXT NOT NULL DEFAULT 'ALL',
    proxy_id INTEGER,
    ban_duration_s INTEGER,
    ban_severity TEXT NOT NULL DEFAULT 'MEDIUM'
);

CREATE TABLE IF NOT EXISTS notification_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    event_type TEXT NOT NULL,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    severity TEXT NOT NULL,
    status TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    error TEXT
);

CREATE TABLE IF NOT EXISTS matrix_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    severity_level TEXT NOT NULL,
    count_threshold INTEGER NOT NULL,
    time_window_s INTEGER NOT NULL,
    notification_delay_s INTEGER NOT NULL,
    last_triggered TEXT
);
"#;

/// Open (creating if necessary) the config-side SQLite store (`database.db`
/// in spec §6) and apply the schema.
pub async fn open(path: &Path) -> Result<SqlitePool, Layer7Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Layer7Error::fatal(
                    format!("failed to create store directory: {e}"),
                    "check filesystem permissions for the configured store path",
                )
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(|e| {
            Layer7Error::fatal(
                format!("invalid store path: {e}"),
                "check event_store.path / ban.store_path in configuration",
            )
        })?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|e| {
            Layer7Error::fatal(
                format!("failed to open store: {e}"),
                "verify the store path is writable and not corrupted",
            )
        })?;

    sqlx::query(SCHEMA)
        .execute(&pool)
        .await
        .map_err(|e| Layer7Error::Database(e.to_string()))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_applies_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.db");
        let pool = open(&path).await.unwrap();

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bans")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
