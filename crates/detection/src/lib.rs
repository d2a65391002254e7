//! Detection engine (spec §4.8): a 5-second poll over newly appended WAF
//! events, per-IP sliding windows kept in a `dashmap::DashMap` (the same
//! lock-free-bucket shape the teacher's `layer7waf-rate-limit` crate uses),
//! and priority-ordered rule evaluation that triggers bans through
//! `layer7waf-ban-orchestrator`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use layer7waf_ban_orchestrator::{BanOptions, BanOrchestrator};
use layer7waf_common::{BanSeverity, Layer7Error, Outcome, Severity};
use layer7waf_ip_policy::WhitelistStore;
use layer7waf_store::types::DetectionRule;

#[derive(Debug, Clone)]
struct TrackedEvent {
    timestamp: DateTime<Utc>,
    attack_type: String,
    severity: Severity,
    proxy_id: Option<i64>,
    event_id: i64,
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub poll_interval_ms: u64,
    pub poll_batch_limit: i64,
    pub window_retention_secs: i64,
    pub window_cleanup_interval_secs: u64,
}

impl From<&layer7waf_common::config::DetectionConfig> for DetectionConfig {
    fn from(cfg: &layer7waf_common::config::DetectionConfig) -> Self {
        Self {
            poll_interval_ms: cfg.poll_interval_ms,
            poll_batch_limit: cfg.poll_batch_limit,
            window_retention_secs: cfg.window_retention_secs,
            window_cleanup_interval_secs: cfg.window_cleanup_interval_secs,
        }
    }
}

pub struct DetectionEngine {
    config: DetectionConfig,
    event_store_pool: SqlitePool,
    rules_pool: SqlitePool,
    whitelist: Arc<WhitelistStore>,
    orchestrator: Arc<BanOrchestrator>,
    windows: DashMap<String, Vec<TrackedEvent>>,
    last_processed_id: AtomicI64,
}

impl DetectionEngine {
    pub fn new(
        config: DetectionConfig,
        event_store_pool: SqlitePool,
        rules_pool: SqlitePool,
        whitelist: Arc<WhitelistStore>,
        orchestrator: Arc<BanOrchestrator>,
    ) -> Self {
        Self {
            config,
            event_store_pool,
            rules_pool,
            whitelist,
            orchestrator,
            windows: DashMap::new(),
            last_processed_id: AtomicI64::new(0),
        }
    }

    /// Spec §4.8 "Polling": query the store for `id > lastProcessedId`,
    /// bounded by `poll_batch_limit`, then evaluate rules for every IP that
    /// received a new event this pass.
    async fn poll_once(&self, now: DateTime<Utc>) -> Result<(), Layer7Error> {
        let since_id = self.last_processed_id.load(Ordering::Acquire);
        let events = layer7waf_event_store::query_new(&self.event_store_pool, since_id, self.config.poll_batch_limit).await?;
        if events.is_empty() {
            return Ok(());
        }

        let rules = layer7waf_store::rules::list_enabled_by_priority(&self.rules_pool).await?;
        let mut touched: Vec<String> = Vec::new();
        let mut max_id = since_id;

        for event in &events {
            let id = event.id.unwrap_or(since_id);
            max_id = max_id.max(id);

            let ip: std::net::IpAddr = match event.client_ip.parse() {
                Ok(ip) => ip,
                Err(_) => continue,
            };
            if self.whitelist.is_whitelisted(ip) {
                continue;
            }

            let mut entry = self.windows.entry(event.client_ip.clone()).or_default();
            entry.push(TrackedEvent {
                timestamp: event.timestamp,
                attack_type: event.attack_type.clone(),
                severity: event.severity,
                proxy_id: event.proxy_id,
                event_id: id,
            });
            let cutoff = now - chrono::Duration::seconds(self.config.window_retention_secs);
            entry.retain(|e| e.timestamp >= cutoff);
            drop(entry);

            if !touched.contains(&event.client_ip) {
                touched.push(event.client_ip.clone());
            }
        }

        self.last_processed_id.store(max_id, Ordering::Release);

        for ip in touched {
            self.evaluate_rules_for_ip(&ip, &rules, now).await;
        }

        Ok(())
    }

    /// Spec §4.8 "Rule evaluation": ascending priority, first match wins and
    /// clears the IP's window.
    async fn evaluate_rules_for_ip(&self, ip: &str, rules: &[DetectionRule], now: DateTime<Utc>) {
        for rule in rules {
            let matched = {
                let Some(entry) = self.windows.get(ip) else { return };
                let window_start = now - chrono::Duration::seconds(rule.time_window_s);
                let mut matched: Vec<TrackedEvent> = entry
                    .iter()
                    .filter(|e| e.timestamp >= window_start)
                    .filter(|e| rule.attack_types.is_empty() || rule.attack_types.contains(&e.attack_type))
                    .filter(|e| rule.severity_filter.admits(e.severity))
                    .filter(|e| rule.proxy_id.is_none() || e.proxy_id == rule.proxy_id)
                    .cloned()
                    .collect();
                matched.sort_by_key(|e| e.timestamp);
                matched
            };

            if (matched.len() as i64) < rule.threshold {
                continue;
            }

            let sample_events: Vec<i64> = matched.iter().take(5).map(|e| e.event_id).collect();
            let attack_type = matched.last().map(|e| e.attack_type.clone());
            let reason = format!("Auto-ban: {} ({} events in {}s)", rule.name, matched.len(), rule.time_window_s);

            let opts = BanOptions {
                reason,
                attack_type,
                event_count: matched.len() as i64,
                severity: rule.ban_severity,
                duration_s: rule.ban_duration_s,
                auto_banned: true,
                banned_by: None,
                proxy_id: rule.proxy_id,
                detection_rule_id: Some(rule.id),
                sample_events,
            };

            match self.orchestrator.ban(ip, opts, now).await {
                Ok(Outcome::Ok(created)) => info!(ip, rule = %rule.name, ban_id = created.ban_id, "detection engine issued ban"),
                Ok(Outcome::Refused(refusal)) => info!(ip, rule = %rule.name, %refusal, "detection engine ban refused"),
                Err(e) => error!(ip, rule = %rule.name, error = %e, "detection engine failed to issue ban"),
            }

            self.windows.remove(ip);
            return;
        }
    }

    fn cleanup_windows(&self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::seconds(self.config.window_retention_secs);
        self.windows.retain(|_, events| {
            events.retain(|e| e.timestamp >= cutoff);
            !events.is_empty()
        });
    }

    /// Runs `poll_once` on `poll_interval_ms` and a window cleanup sweep on
    /// `window_cleanup_interval_secs`, until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut poll_ticker = tokio::time::interval(std::time::Duration::from_millis(self.config.poll_interval_ms));
        let mut cleanup_ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.window_cleanup_interval_secs));

        loop {
            tokio::select! {
                _ = poll_ticker.tick() => {
                    if let Err(e) = self.poll_once(Utc::now()).await {
                        warn!(error = %e, "detection poll failed");
                    }
                }
                _ = cleanup_ticker.tick() => {
                    self.cleanup_windows(Utc::now());
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("detection engine stopped");
    }

    #[cfg(test)]
    fn window_len(&self, ip: &str) -> usize {
        self.windows.get(ip).map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layer7waf_common::SeverityFilter;
    use layer7waf_event_bus::EventBus;
    use layer7waf_firewall::{FirewallRegistry, NoopProvider};
    use layer7waf_notifications::NullSink;
    use layer7waf_store::rules::NewDetectionRule;

    async fn engine() -> (DetectionEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store_pool = layer7waf_store::open(&dir.path().join("database.db")).await.unwrap();
        let event_pool = layer7waf_event_store::open(&dir.path().join("waf-events.db")).await.unwrap();

        let mut registry = FirewallRegistry::new();
        registry.register(1, Arc::new(NoopProvider::new()));
        let orchestrator = Arc::new(BanOrchestrator::new(
            store_pool.clone(),
            Arc::new(WhitelistStore::new()),
            &registry,
            Arc::new(EventBus::new()),
            Arc::new(NullSink),
            50,
        ));

        let config = DetectionConfig {
            poll_interval_ms: 50,
            poll_batch_limit: 1000,
            window_retention_secs: 3600,
            window_cleanup_interval_secs: 300,
        };
        let engine = DetectionEngine::new(config, event_pool, store_pool, Arc::new(WhitelistStore::new()), orchestrator);
        (engine, dir)
    }

    fn rule(threshold: i64, window_s: i64) -> NewDetectionRule {
        NewDetectionRule {
            name: "sqli burst".into(),
            enabled: true,
            priority: 10,
            time_window_s: window_s,
            threshold,
            attack_types: vec!["sqli".into()],
            severity_filter: SeverityFilter::All,
            proxy_id: None,
            ban_duration_s: Some(3600),
            ban_severity: BanSeverity::High,
        }
    }

    fn event(ip: &str, attack_type: &str, at: DateTime<Utc>) -> layer7waf_common::WafEvent {
        layer7waf_common::WafEvent {
            id: None,
            proxy_id: None,
            timestamp: at,
            client_ip: ip.to_string(),
            request_method: "GET".into(),
            request_uri: "/".into(),
            attack_type: attack_type.to_string(),
            rule_id: "942100".into(),
            severity: Severity::Warning,
            message: "m".into(),
            raw_log: "{}".into(),
            blocked: true,
            notified: false,
        }
    }

    #[tokio::test]
    async fn ip_crossing_threshold_is_banned_and_window_cleared() {
        let (engine, _dir) = engine().await;
        let now = Utc::now();
        layer7waf_store::rules::create(&engine.rules_pool, rule(3, 300)).await.unwrap();

        let events: Vec<_> = (0..3).map(|_| event("203.0.113.20", "sqli", now)).collect();
        layer7waf_event_store::append(&engine.event_store_pool, &events).await.unwrap();

        engine.poll_once(now).await.unwrap();

        let active = layer7waf_store::bans::find_active_by_ip(&engine.rules_pool, "203.0.113.20", now).await.unwrap();
        assert!(active.is_some());
        assert_eq!(engine.window_len("203.0.113.20"), 0);
    }

    #[tokio::test]
    async fn below_threshold_does_not_ban() {
        let (engine, _dir) = engine().await;
        let now = Utc::now();
        layer7waf_store::rules::create(&engine.rules_pool, rule(5, 300)).await.unwrap();

        let events: Vec<_> = (0..2).map(|_| event("203.0.113.21", "sqli", now)).collect();
        layer7waf_event_store::append(&engine.event_store_pool, &events).await.unwrap();

        engine.poll_once(now).await.unwrap();

        let active = layer7waf_store::bans::find_active_by_ip(&engine.rules_pool, "203.0.113.21", now).await.unwrap();
        assert!(active.is_none());
        assert_eq!(engine.window_len("203.0.113.21"), 2);
    }

    #[tokio::test]
    async fn whitelisted_ip_is_never_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let store_pool = layer7waf_store::open(&dir.path().join("database.db")).await.unwrap();
        let event_pool = layer7waf_event_store::open(&dir.path().join("waf-events.db")).await.unwrap();

        let whitelist = Arc::new(WhitelistStore::from_entries(vec![layer7waf_ip_policy::WhitelistEntry {
            id: 1,
            ip_address: "198.51.100.5".parse().ok(),
            ip_range: None,
            entry_type: layer7waf_ip_policy::WhitelistType::Manual,
            priority: 1,
            reason: "trusted".into(),
            added_by: None,
        }]));

        let registry = FirewallRegistry::new();
        let orchestrator = Arc::new(BanOrchestrator::new(
            store_pool.clone(),
            whitelist.clone(),
            &registry,
            Arc::new(EventBus::new()),
            Arc::new(NullSink),
            50,
        ));

        let config = DetectionConfig { poll_interval_ms: 50, poll_batch_limit: 1000, window_retention_secs: 3600, window_cleanup_interval_secs: 300 };
        let engine = DetectionEngine::new(config, event_pool, store_pool, whitelist, orchestrator);

        let now = Utc::now();
        layer7waf_store::rules::create(&engine.rules_pool, rule(1, 300)).await.unwrap();
        layer7waf_event_store::append(&engine.event_store_pool, &[event("198.51.100.5", "sqli", now)]).await.unwrap();

        engine.poll_once(now).await.unwrap();
        assert_eq!(engine.window_len("198.51.100.5"), 0);
    }

    #[tokio::test]
    async fn cleanup_evicts_stale_entries() {
        let (engine, _dir) = engine().await;
        let old = Utc::now() - chrono::Duration::hours(2);
        layer7waf_store::rules::create(&engine.rules_pool, rule(10, 300)).await.unwrap();
        layer7waf_event_store::append(&engine.event_store_pool, &[event("203.0.113.22", "sqli", old)]).await.unwrap();

        engine.poll_once(old).await.unwrap();
        assert_eq!(engine.window_len("203.0.113.22"), 1);

        engine.cleanup_windows(Utc::now());
        assert_eq!(engine.window_len("203.0.113.22"), 0);
    }
}
