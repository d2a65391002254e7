use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use layer7waf_common::BanSeverity;

/// One entry in a Ban's `integrations_notified` list (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationNotified {
    pub integration_id: i64,
    pub provider_ban_id: Option<String>,
    pub notified_at: DateTime<Utc>,
}

/// An authoritative ban record (spec §3 `Ban`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ban {
    pub id: i64,
    pub ip_address: String,
    pub reason: String,
    pub attack_type: Option<String>,
    pub event_count: i64,
    pub severity: BanSeverity,
    pub banned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub unbanned_at: Option<DateTime<Utc>>,
    pub unbanned_by: Option<String>,
    pub auto_banned: bool,
    pub banned_by: Option<String>,
    pub proxy_id: Option<i64>,
    pub detection_rule_id: Option<i64>,
    pub sample_events: Vec<i64>,
    pub integrations_notified: Vec<IntegrationNotified>,
}

impl Ban {
    /// Spec §3 invariant: a ban is "active" if it hasn't been unbanned and
    /// either has no expiry or hasn't expired yet.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.unbanned_at.is_none() && self.expires_at.map(|e| e > now).unwrap_or(true)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.unbanned_at.is_none() && self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

/// Parameters accepted by `Ban::create` / the orchestrator's `Ban` op.
#[derive(Debug, Clone)]
pub struct NewBan {
    pub ip_address: String,
    pub reason: String,
    pub attack_type: Option<String>,
    pub event_count: i64,
    pub severity: BanSeverity,
    pub duration_s: Option<i64>,
    pub auto_banned: bool,
    pub banned_by: Option<String>,
    pub proxy_id: Option<i64>,
    pub detection_rule_id: Option<i64>,
    pub sample_events: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationProvider {
    FirewallA,
    FirewallB,
    CdnC,
    Noop,
}

impl IntegrationProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationProvider::FirewallA => "firewall-a",
            IntegrationProvider::FirewallB => "firewall-b",
            IntegrationProvider::CdnC => "cdn-c",
            IntegrationProvider::Noop => "noop",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "firewall-a" => Some(IntegrationProvider::FirewallA),
            "firewall-b" => Some(IntegrationProvider::FirewallB),
            "cdn-c" => Some(IntegrationProvider::CdnC),
            "noop" => Some(IntegrationProvider::Noop),
            _ => None,
        }
    }
}

/// A configured upstream firewall/CDN integration (spec §3 `Integration`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: i64,
    pub name: String,
    pub provider: String,
    pub enabled: bool,
    pub credentials_encrypted: String,
    pub scope: Option<String>,
}

/// Spec §3 `DetectionRule`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRule {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub priority: i64,
    pub time_window_s: i64,
    pub threshold: i64,
    /// Empty means "match any attack type" (the `*` wildcard of §3).
    pub attack_types: Vec<String>,
    pub severity_filter: layer7waf_common::SeverityFilter,
    pub proxy_id: Option<i64>,
    pub ban_duration_s: Option<i64>,
    pub ban_severity: BanSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Sent,
    Failed,
}

/// Spec §3 `NotificationRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub channel: String,
    pub event_type: String,
    pub title: String,
    pub body: String,
    pub severity: String,
    pub status: NotificationStatus,
    pub sent_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Spec §3 `MatrixRule` / §4.9 "Matrix rules (optional)": an alternative,
/// schedule-evaluated path to the same notification pipeline as the
/// threshold/cooldown triggers, keyed on WAF event severity rather than a
/// specific trigger type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixRule {
    pub id: i64,
    pub severity_level: layer7waf_common::Severity,
    pub count_threshold: i64,
    pub time_window_s: i64,
    pub notification_delay_s: i64,
    pub last_triggered: Option<DateTime<Utc>>,
}
