use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use layer7waf_common::Layer7Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS waf_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    proxy_id INTEGER,
    timestamp TEXT NOT NULL,
    client_ip TEXT NOT NULL,
    request_method TEXT NOT NULL,
    request_uri TEXT NOT NULL,
    attack_type TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    raw_log TEXT NOT NULL,
    blocked INTEGER NOT NULL DEFAULT 0,
    notified INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_waf_events_timestamp ON waf_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_waf_events_proxy_id ON waf_events(proxy_id);
CREATE INDEX IF NOT EXISTS idx_waf_events_client_ip ON waf_events(client_ip);
CREATE INDEX IF NOT EXISTS idx_waf_events_attack_type ON waf_events(attack_type);
CREATE INDEX IF NOT EXISTS idx_waf_events_severity ON waf_events(severity);
CREATE INDEX IF NOT EXISTS idx_waf_events_blocked ON waf_events(blocked);
"#;

/// Open (creating if necessary) the immutable WAF event log (`waf-events.db`
/// in spec §6), separate from the config-side store so retention sweeps
/// never contend with config writes.
pub async fn open(path: &Path) -> Result<SqlitePool, Layer7Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Layer7Error::fatal(
                    format!("failed to create event store directory: {e}"),
                    "check filesystem permissions for the configured event store path",
                )
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(|e| {
            Layer7Error::fatal(
                format!("invalid event store path: {e}"),
                "check event_store.path in configuration",
            )
        })?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|e| {
            Layer7Error::fatal(
                format!("failed to open event store: {e}"),
                "verify the event store path is writable and not corrupted",
            )
        })?;

    sqlx::query(SCHEMA)
        .execute(&pool)
        .await
        .map_err(|e| Layer7Error::Database(e.to_string()))?;

    Ok(pool)
}
