use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the WAF telemetry / ban pipeline.
///
/// Mirrors the shape of the teacher's `AppConfig` (nested sub-structs with
/// `#[serde(default)]` helpers, loaded from YAML), generalized from "reverse
/// proxy settings" to "ingest, detection, ban, and notification settings".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub audit_log: AuditLogConfig,
    #[serde(default)]
    pub event_store: EventStoreConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub ban: BanConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            audit_log: AuditLogConfig::default(),
            event_store: EventStoreConfig::default(),
            detection: DetectionConfig::default(),
            ban: BanConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            notifications: NotificationConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogConfig {
    #[serde(default = "default_audit_log_path")]
    pub path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_backfill_interval_secs")]
    pub backfill_interval_secs: u64,
    /// How far back from now to scan for orphaned (`proxy_id IS NULL`)
    /// events (spec §4.7 "last 10 minutes"). Distinct from the ±5-minute
    /// window used to match each orphan against nearby resolved events.
    #[serde(default = "default_backfill_window_secs")]
    pub backfill_window_secs: i64,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            path: default_audit_log_path(),
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
            backfill_interval_secs: default_backfill_interval_secs(),
            backfill_window_secs: default_backfill_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStoreConfig {
    #[serde(default = "default_event_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_purge_hour_local")]
    pub purge_hour_local: u32,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            path: default_event_store_path(),
            retention_days: default_retention_days(),
            purge_hour_local: default_purge_hour_local(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_batch_limit")]
    pub poll_batch_limit: i64,
    #[serde(default = "default_window_retention_secs")]
    pub window_retention_secs: i64,
    #[serde(default = "default_window_cleanup_interval_secs")]
    pub window_cleanup_interval_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_batch_limit: default_poll_batch_limit(),
            window_retention_secs: default_window_retention_secs(),
            window_cleanup_interval_secs: default_window_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_expiry_sweep_interval_secs")]
    pub expiry_sweep_interval_secs: u64,
    #[serde(default = "default_queue_retry_base_secs")]
    pub queue_retry_base_secs: u64,
    #[serde(default = "default_queue_retry_cap_secs")]
    pub queue_retry_cap_secs: u64,
    #[serde(default = "default_queue_max_attempts")]
    pub queue_max_attempts: u32,
    #[serde(default = "default_provider_rps")]
    pub provider_rps: u64,
    #[serde(default = "default_provider_burst")]
    pub provider_burst: u64,
    #[serde(default = "default_provider_deadline_secs")]
    pub provider_deadline_secs: u64,
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            expiry_sweep_interval_secs: default_expiry_sweep_interval_secs(),
            queue_retry_base_secs: default_queue_retry_base_secs(),
            queue_retry_cap_secs: default_queue_retry_cap_secs(),
            queue_max_attempts: default_queue_max_attempts(),
            provider_rps: default_provider_rps(),
            provider_burst: default_provider_burst(),
            provider_deadline_secs: default_provider_deadline_secs(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_reconciliation_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconciliation_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_outbound_command")]
    pub outbound_command: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_high_severity_cooldown_secs")]
    pub high_severity_cooldown_secs: i64,
    #[serde(default = "default_waf_threshold")]
    pub waf_block_threshold: u64,
    #[serde(default = "default_waf_threshold_window_secs")]
    pub waf_block_threshold_window_secs: i64,
    #[serde(default)]
    pub batching_enabled: bool,
    #[serde(default = "default_batch_interval_secs")]
    pub batch_interval_secs: i64,
    #[serde(default = "default_daily_report_hour_local")]
    pub daily_report_hour_local: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            outbound_command: default_outbound_command(),
            command_timeout_secs: default_command_timeout_secs(),
            high_severity_cooldown_secs: default_high_severity_cooldown_secs(),
            waf_block_threshold: default_waf_threshold(),
            waf_block_threshold_window_secs: default_waf_threshold_window_secs(),
            batching_enabled: false,
            batch_interval_secs: default_batch_interval_secs(),
            daily_report_hour_local: default_daily_report_hour_local(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/var/log/modsecurity/audit.log")
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_interval_ms() -> u64 {
    2000
}
fn default_backfill_interval_secs() -> u64 {
    120
}
fn default_backfill_window_secs() -> i64 {
    600
}
fn default_event_store_path() -> PathBuf {
    PathBuf::from("data/waf-events.db")
}
fn default_retention_days() -> i64 {
    90
}
fn default_purge_hour_local() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_poll_batch_limit() -> i64 {
    1000
}
fn default_window_retention_secs() -> i64 {
    3600
}
fn default_window_cleanup_interval_secs() -> u64 {
    300
}
fn default_store_path() -> PathBuf {
    PathBuf::from("data/database.db")
}
fn default_expiry_sweep_interval_secs() -> u64 {
    60
}
fn default_queue_retry_base_secs() -> u64 {
    2
}
fn default_queue_retry_cap_secs() -> u64 {
    300
}
fn default_queue_max_attempts() -> u32 {
    5
}
fn default_provider_rps() -> u64 {
    5
}
fn default_provider_burst() -> u64 {
    10
}
fn default_provider_deadline_secs() -> u64 {
    10
}
fn default_shutdown_drain_secs() -> u64 {
    30
}
fn default_reconciliation_interval_secs() -> u64 {
    60
}
fn default_outbound_command() -> String {
    "/usr/local/bin/notify".to_string()
}
fn default_command_timeout_secs() -> u64 {
    10
}
fn default_high_severity_cooldown_secs() -> i64 {
    300
}
fn default_waf_threshold() -> u64 {
    10
}
fn default_waf_threshold_window_secs() -> i64 {
    300
}
fn default_batch_interval_secs() -> i64 {
    60
}
fn default_daily_report_hour_local() -> u32 {
    6
}
fn default_admin_listen() -> String {
    "127.0.0.1:9191".to_string()
}

impl PipelineConfig {
    /// Load configuration from a YAML file, validating it before returning.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for internal consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.event_store.retention_days <= 0 {
            anyhow::bail!("event_store.retention_days must be positive");
        }
        if self.ban.queue_max_attempts == 0 {
            anyhow::bail!("ban.queue_max_attempts must be at least 1");
        }
        if self.ban.provider_rps == 0 {
            anyhow::bail!("ban.provider_rps must be at least 1");
        }
        if self.detection.poll_batch_limit <= 0 {
            anyhow::bail!("detection.poll_batch_limit must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = PipelineConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_from_yaml() {
        let yaml = r#"
audit_log:
  path: /tmp/audit.log
  batch_size: 50
event_store:
  retention_days: 30
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();

        let cfg = PipelineConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.audit_log.batch_size, 50);
        assert_eq!(cfg.event_store.retention_days, 30);
        // Untouched sections still get their defaults.
        assert_eq!(cfg.ban.queue_max_attempts, 5);
    }

    #[test]
    fn rejects_invalid_retention() {
        let mut cfg = PipelineConfig::default();
        cfg.event_store.retention_days = 0;
        assert!(cfg.validate().is_err());
    }
}
