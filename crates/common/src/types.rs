use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity scale used by detection rules and notifications.
///
/// Ordered so that `CRITICAL > ERROR > WARNING > NOTICE`; used both for
/// ModSecurity severity normalisation (§4.7) and rule `severity_filter`
/// comparisons (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Notice,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Map a ModSecurity numeric severity (0-5, lower is worse) onto our
    /// textual scale, per the reconstruction in spec §4.7.
    pub fn from_modsecurity(level: i64) -> Self {
        match level {
            0..=2 => Severity::Critical,
            3 => Severity::Error,
            4 => Severity::Warning,
            _ => Severity::Notice,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// Filter attached to a detection rule; `All` matches every severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeverityFilter {
    All,
    Warning,
    Error,
    Critical,
}

impl SeverityFilter {
    /// Returns true if `severity` satisfies this filter (>= the named floor).
    pub fn admits(&self, severity: Severity) -> bool {
        match self {
            SeverityFilter::All => true,
            SeverityFilter::Warning => severity >= Severity::Warning,
            SeverityFilter::Error => severity >= Severity::Error,
            SeverityFilter::Critical => severity >= Severity::Critical,
        }
    }
}

/// Severity assigned to a ban, independent of the WAF event severity scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BanSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for BanSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BanSeverity::Low => "LOW",
            BanSeverity::Medium => "MEDIUM",
            BanSeverity::High => "HIGH",
            BanSeverity::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// A single ModSecurity-derived WAF event, the unit stored by the event
/// store (§3 `WAFEvent`) and consumed by the detection engine (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafEvent {
    /// Populated once the event has been assigned an id by the store.
    pub id: Option<i64>,
    pub proxy_id: Option<i64>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub client_ip: String,
    pub request_method: String,
    pub request_uri: String,
    pub attack_type: String,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub raw_log: String,
    pub blocked: bool,
    pub notified: bool,
}

/// Read-only view of a managed proxy, owned by the external config
/// collaborator. The core only ever reads these rows to resolve events
/// (spec §3 `Proxy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: i64,
    pub name: String,
    pub domain_names: Vec<String>,
    pub forward_host: String,
    pub forward_port: u16,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modsecurity_severity_mapping() {
        assert_eq!(Severity::from_modsecurity(0), Severity::Critical);
        assert_eq!(Severity::from_modsecurity(2), Severity::Critical);
        assert_eq!(Severity::from_modsecurity(3), Severity::Error);
        assert_eq!(Severity::from_modsecurity(4), Severity::Warning);
        assert_eq!(Severity::from_modsecurity(5), Severity::Notice);
        assert_eq!(Severity::from_modsecurity(99), Severity::Notice);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Notice);
    }

    #[test]
    fn severity_filter_admits() {
        assert!(SeverityFilter::All.admits(Severity::Notice));
        assert!(!SeverityFilter::Error.admits(Severity::Warning));
        assert!(SeverityFilter::Error.admits(Severity::Critical));
    }
}
