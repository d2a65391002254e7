//! ModSecurity audit-log JSON parsing and extraction (spec §4.7, §6).

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use layer7waf_common::{Severity, WafEvent};

use crate::resolver::ProxyResolver;

#[derive(Debug, Deserialize)]
pub struct AuditRecord {
    pub transaction: Transaction,
}

#[derive(Debug, Deserialize)]
pub struct Transaction {
    pub time_stamp: String,
    pub client_ip: String,
    pub host_ip: String,
    pub request: Request,
    #[serde(default)]
    pub response: Response,
    #[serde(default)]
    pub producer: Producer,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Request {
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Response {
    pub http_code: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Producer {
    pub intercepted: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub message: String,
    #[serde(default)]
    pub details: Details,
}

#[derive(Debug, Default, Deserialize)]
pub struct Details {
    #[serde(rename = "ruleId", default)]
    pub rule_id: Option<String>,
    pub severity: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Deserializes one audit-log line, silently skipping non-JSON lines (engine
/// startup noise) and half-lines left at a tail reopen.
pub fn parse_line(line: &str) -> Option<AuditRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
}

fn extract_attack_type(tags: &[String]) -> String {
    if let Some(tag) = tags.iter().find(|t| t.starts_with("attack-")) {
        return tag.trim_start_matches("attack-").to_string();
    }
    if !tags.is_empty() {
        return "protocol-violation".to_string();
    }
    "unknown".to_string()
}

/// Spec §4.7 extraction rules, producing the `WafEvent` the event store
/// persists. Returns `None` for a record with no detection messages.
pub async fn extract(record: &AuditRecord, raw_log: &str, resolver: &dyn ProxyResolver) -> Option<WafEvent> {
    let tx = &record.transaction;
    let first = tx.messages.first()?;

    let attack_type = extract_attack_type(&first.details.tags);
    let blocked = tx.response.http_code == Some(403) || tx.producer.intercepted == Some(true);
    let severity = Severity::from_modsecurity(first.details.severity.unwrap_or(5));
    let timestamp = DateTime::parse_from_rfc3339(&tx.time_stamp).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now());

    let x_proxy_target = header(&tx.request.headers, "X-Proxy-Target");
    let host = header(&tx.request.headers, "Host");
    let proxy_id = resolver.resolve(x_proxy_target, host, &tx.host_ip).await;

    Some(WafEvent {
        id: None,
        proxy_id,
        timestamp,
        client_ip: tx.client_ip.clone(),
        request_method: tx.request.method.clone(),
        request_uri: tx.request.uri.clone(),
        attack_type,
        rule_id: first.details.rule_id.clone().unwrap_or_default(),
        severity,
        message: first.message.clone(),
        raw_log: raw_log.to_string(),
        blocked,
        notified: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticProxyResolver;

    const SAMPLE: &str = r#"{ "transaction": {
        "time_stamp": "2024-01-01T12:00:00Z",
        "client_ip": "198.51.100.7",
        "host_ip": "10.0.0.5",
        "request": { "method": "GET", "uri": "/login",
                     "headers": { "Host": "app.example.com" } },
        "response": { "http_code": 403 },
        "producer": { "intercepted": true },
        "messages": [ { "message": "SQL Injection Attack Detected",
                        "details": { "ruleId": "942100", "severity": 2, "tags": ["attack-sqli", "OWASP_CRS"] } } ]
    } }"#;

    #[test]
    fn non_json_lines_are_skipped() {
        assert!(parse_line("-- ModSecurity startup banner --").is_none());
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
    }

    #[test]
    fn parses_a_well_formed_record() {
        let record = parse_line(SAMPLE).unwrap();
        assert_eq!(record.transaction.client_ip, "198.51.100.7");
        assert_eq!(record.transaction.messages.len(), 1);
    }

    #[tokio::test]
    async fn extracts_fields_per_spec_rules() {
        let record = parse_line(SAMPLE).unwrap();
        let resolver = StaticProxyResolver::new(vec![]);
        let event = extract(&record, SAMPLE, &resolver).await.unwrap();

        assert_eq!(event.attack_type, "sqli");
        assert!(event.blocked);
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.rule_id, "942100");
        assert_eq!(event.client_ip, "198.51.100.7");
    }

    #[tokio::test]
    async fn records_with_no_messages_are_not_detections() {
        let no_messages = r#"{ "transaction": {
            "time_stamp": "2024-01-01T12:00:00Z",
            "client_ip": "198.51.100.7",
            "host_ip": "10.0.0.5",
            "request": { "method": "GET", "uri": "/", "headers": {} },
            "response": { "http_code": 200 },
            "producer": {},
            "messages": []
        } }"#;
        let record = parse_line(no_messages).unwrap();
        let resolver = StaticProxyResolver::new(vec![]);
        assert!(extract(&record, no_messages, &resolver).await.is_none());
    }

    #[test]
    fn attack_type_falls_back_to_protocol_violation_then_unknown() {
        assert_eq!(extract_attack_type(&["OWASP_CRS".to_string()]), "protocol-violation");
        assert_eq!(extract_attack_type(&[]), "unknown");
        assert_eq!(extract_attack_type(&["attack-xss".to_string()]), "xss");
    }
}
