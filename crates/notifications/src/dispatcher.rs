use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use layer7waf_common::{BanSeverity, Severity};
use layer7waf_event_store::{query_range, RangeFilter};
use layer7waf_store::notifications::{record, NewNotificationRecord};
use layer7waf_store::{matrix, NotificationStatus};

use crate::command::{run_notify_command, OutboundMessage};
use crate::cooldown::CooldownCache;
use crate::sink::NotificationSink;

/// Runtime-tunable half of [`layer7waf_common::config::NotificationConfig`],
/// threaded through at construction and hot-swappable afterwards via
/// `Dispatcher::update_config` (spec §6 `PUT /api/settings/notifications`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DispatcherConfig {
    pub enabled: bool,
    pub outbound_command: String,
    pub command_timeout_secs: u64,
    pub high_severity_cooldown_secs: i64,
    pub waf_block_threshold: u64,
    pub waf_block_threshold_window_secs: i64,
    pub batching_enabled: bool,
    pub batch_interval_secs: i64,
    pub daily_report_hour_local: u32,
}

impl From<&layer7waf_common::config::NotificationConfig> for DispatcherConfig {
    fn from(cfg: &layer7waf_common::config::NotificationConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            outbound_command: cfg.outbound_command.clone(),
            command_timeout_secs: cfg.command_timeout_secs,
            high_severity_cooldown_secs: cfg.high_severity_cooldown_secs,
            waf_block_threshold: cfg.waf_block_threshold,
            waf_block_threshold_window_secs: cfg.waf_block_threshold_window_secs,
            batching_enabled: cfg.batching_enabled,
            batch_interval_secs: cfg.batch_interval_secs,
            daily_report_hour_local: cfg.daily_report_hour_local,
        }
    }
}

/// A fully-formed notification ready to be sent or queued (spec §4.9).
#[derive(Debug, Clone)]
pub struct Notification {
    pub event_type: String,
    pub title: String,
    pub body: String,
    pub severity: String,
    /// If set, `dispatch` suppresses this notification unless the cooldown
    /// cache says the key is due.
    pub cooldown: Option<(String, chrono::Duration)>,
}

struct PendingNotification {
    notification: Notification,
    scheduled_for: DateTime<Utc>,
}

/// Trigger evaluation, cooldown, optional batching, and delivery (spec §4.9).
///
/// Constructed with a reference to both SQLite stores: the config-side store
/// (`database.db`) for `NotificationRecord`/`MatrixRule` persistence, and the
/// WAF event store (`waf-events.db`) for threshold/matrix-rule event counts.
///
/// `config` lives behind an `ArcSwap` (the same hot-reload idiom
/// `WhitelistStore` uses) so the admin API's `PUT /api/settings/notifications`
/// can change behaviour without restarting the dispatcher's background tasks.
pub struct Dispatcher {
    config: ArcSwap<DispatcherConfig>,
    cooldown: CooldownCache,
    store_pool: SqlitePool,
    event_store_pool: SqlitePool,
    batch_queue: Mutex<Vec<PendingNotification>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, store_pool: SqlitePool, event_store_pool: SqlitePool) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            cooldown: CooldownCache::new(),
            store_pool,
            event_store_pool,
            batch_queue: Mutex::new(Vec::new()),
        }
    }

    /// Current settings snapshot, for the admin API's `GET
    /// /api/settings/notifications`.
    pub fn config(&self) -> Arc<DispatcherConfig> {
        self.config.load_full()
    }

    /// Replaces the live settings snapshot, for `PUT
    /// /api/settings/notifications`. Takes effect on the next `dispatch`
    /// call and the next tick of the batch/daily-report background loops.
    pub fn update_config(&self, config: DispatcherConfig) {
        self.config.store(Arc::new(config));
    }

    /// Spec §4.9 `Dispatch`: evaluates cooldown, then either queues the
    /// notification for the batch worker or sends it immediately.
    pub async fn dispatch(&self, notification: Notification, now: DateTime<Utc>) {
        let config = self.config.load();
        if !config.enabled {
            return;
        }

        if let Some((ref key, cooldown)) = notification.cooldown {
            if !self.cooldown.should_fire(key, cooldown, now) {
                return;
            }
        }

        if config.batching_enabled {
            let scheduled_for = now + chrono::Duration::seconds(config.batch_interval_secs);
            self.batch_queue.lock().await.push(PendingNotification { notification, scheduled_for });
            return;
        }

        drop(config);
        self.send_now(&notification, now).await;
    }

    async fn send_now(&self, notification: &Notification, now: DateTime<Utc>) {
        let config = self.config.load();
        let message = OutboundMessage {
            event_type: notification.event_type.clone(),
            title: notification.title.clone(),
            body: notification.body.clone(),
            tag: "waf".into(),
            urls: Vec::new(),
        };

        let result = run_notify_command(&config.outbound_command, &message, config.command_timeout_secs).await;

        let (status, error) = match &result {
            Ok(()) => (NotificationStatus::Sent, None),
            Err(e) => {
                warn!(event_type = %notification.event_type, error = %e, "notification delivery failed");
                (NotificationStatus::Failed, Some(e.to_string()))
            }
        };

        if let Err(e) = record(
            &self.store_pool,
            NewNotificationRecord {
                channel: config.outbound_command.clone(),
                event_type: notification.event_type.clone(),
                title: notification.title.clone(),
                body: notification.body.clone(),
                severity: notification.severity.clone(),
                status,
                error,
            },
            now,
        )
        .await
        {
            error!(error = %e, "failed to persist notification record");
        }
    }

    /// Background task: sends any batched notification whose `scheduled_for`
    /// has arrived. Runs until `cancel` fires.
    pub async fn run_batch_worker(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let now = Utc::now();
            let due: Vec<Notification> = {
                let mut queue = self.batch_queue.lock().await;
                let (due, pending): (Vec<_>, Vec<_>) = queue.drain(..).partition(|p| p.scheduled_for <= now);
                *queue = pending;
                due.into_iter().map(|p| p.notification).collect()
            };

            for notification in due {
                self.send_now(&notification, now).await;
            }
        }
        info!("notification batch worker stopped");
    }

    /// Spec §4.9 WAF trigger evaluation. Called by the ingestor once per
    /// appended event: evaluates the rolling WAF-block threshold and the
    /// high-severity cooldown directly against the event store, rather than
    /// keeping a second in-memory counter alongside the detection engine's.
    pub async fn on_waf_event(&self, ip: &str, severity: Severity, blocked: bool, now: DateTime<Utc>) {
        let config = self.config.load_full();
        if severity >= Severity::Error {
            let key = format!("high_severity_{ip}");
            let cooldown = chrono::Duration::seconds(config.high_severity_cooldown_secs);
            if self.cooldown.should_fire(&key, cooldown, now) {
                self.dispatch(
                    Notification {
                        event_type: "waf_high_severity".into(),
                        title: format!("High-severity WAF event from {ip}"),
                        body: format!("{ip} triggered a {severity} WAF event"),
                        severity: severity.to_string(),
                        cooldown: None,
                    },
                    now,
                )
                .await;
            }
        }

        if !blocked {
            return;
        }

        let window = chrono::Duration::seconds(config.waf_block_threshold_window_secs);
        let filter = RangeFilter {
            blocked: Some(true),
            since: Some(now - window),
            ..Default::default()
        };
        let count = match query_range(&self.event_store_pool, &filter, 10_000, 0).await {
            Ok(events) => events.len() as u64,
            Err(e) => {
                error!(error = %e, "failed to query blocked-event count for threshold check");
                return;
            }
        };

        if count < config.waf_block_threshold {
            return;
        }

        let cooldown = chrono::Duration::seconds(config.waf_block_threshold_window_secs);
        if self.cooldown.should_fire("waf_blocks_threshold", cooldown, now) {
            self.dispatch(
                Notification {
                    event_type: "waf_block_threshold".into(),
                    title: "WAF block threshold exceeded".into(),
                    body: format!("{count} blocked requests in the last {}s", window.num_seconds()),
                    severity: "WARNING".into(),
                    cooldown: None,
                },
                now,
            )
            .await;
        }
    }

    /// Spec §4.9 "Matrix rules (optional)": schedule-evaluated alternative
    /// trigger path keyed on WAF event severity rather than a fixed trigger
    /// type. Intended to run on a periodic tick (e.g. every 30s).
    pub async fn evaluate_matrix_rules(&self, now: DateTime<Utc>) {
        let rules = match matrix::list_all(&self.store_pool).await {
            Ok(rules) => rules,
            Err(e) => {
                error!(error = %e, "failed to load matrix rules");
                return;
            }
        };

        for rule in rules {
            let due = match rule.last_triggered {
                Some(last) => now - last >= chrono::Duration::seconds(rule.notification_delay_s),
                None => true,
            };
            if !due {
                continue;
            }

            let filter = RangeFilter {
                severity: Some(rule.severity_level),
                since: Some(now - chrono::Duration::seconds(rule.time_window_s)),
                ..Default::default()
            };
            let count = match query_range(&self.event_store_pool, &filter, 10_000, 0).await {
                Ok(events) => events.len() as i64,
                Err(e) => {
                    error!(error = %e, rule_id = rule.id, "failed to evaluate matrix rule");
                    continue;
                }
            };

            if count < rule.count_threshold {
                continue;
            }

            self.dispatch(
                Notification {
                    event_type: "matrix_rule".into(),
                    title: format!("Matrix rule #{} triggered", rule.id),
                    body: format!("{count} {} events in the last {}s", rule.severity_level, rule.time_window_s),
                    severity: rule.severity_level.to_string(),
                    cooldown: None,
                },
                now,
            )
            .await;

            if let Err(e) = matrix::mark_triggered(&self.store_pool, rule.id, now).await {
                error!(error = %e, rule_id = rule.id, "failed to record matrix rule trigger");
            }
        }
    }

    /// Spec §4.9 "Daily report": composes a WAF summary and a ban summary
    /// for the prior day. Traffic statistics are out of scope (access-log
    /// parsing is an external collaborator, per spec §1).
    pub async fn send_daily_report(&self, now: DateTime<Utc>) {
        let since = now - chrono::Duration::hours(24);

        let waf_filter = RangeFilter { since: Some(since), ..Default::default() };
        let waf_count = match query_range(&self.event_store_pool, &waf_filter, 100_000, 0).await {
            Ok(events) => events.len(),
            Err(e) => {
                error!(error = %e, "failed to compose daily WAF summary");
                return;
            }
        };

        let ban_stats = match layer7waf_store::bans::statistics(&self.store_pool, now).await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "failed to compose daily ban summary");
                return;
            }
        };

        let body = format!(
            "WAF events (24h): {waf_count}. Active bans: {} ({} auto, {} manual, {} permanent, {} temporary).",
            ban_stats.total_active, ban_stats.auto_banned, ban_stats.manual_banned, ban_stats.permanent, ban_stats.temporary
        );

        self.dispatch(
            Notification {
                event_type: "daily_report".into(),
                title: "Daily WAF and ban report".into(),
                body,
                severity: "NOTICE".into(),
                cooldown: None,
            },
            now,
        )
        .await;
    }

    /// Cron-style scheduler: fires `send_daily_report` once per local day at
    /// `daily_report_hour_local`, checked every minute.
    pub async fn run_daily_report_scheduler(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        let mut last_fired_day: Option<chrono::NaiveDate> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let local_now = chrono::Local::now();
            if local_now.hour() == self.config.load().daily_report_hour_local && last_fired_day != Some(local_now.date_naive()) {
                self.send_daily_report(Utc::now()).await;
                last_fired_day = Some(local_now.date_naive());
            }
        }
        info!("daily report scheduler stopped");
    }

    /// Ticks [`evaluate_matrix_rules`](Self::evaluate_matrix_rules) every 30s.
    pub async fn run_matrix_rule_scheduler(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            self.evaluate_matrix_rules(Utc::now()).await;
        }
        info!("matrix rule scheduler stopped");
    }
}

fn ban_severity_label(s: BanSeverity) -> &'static str {
    match s {
        BanSeverity::Low => "LOW",
        BanSeverity::Medium => "MEDIUM",
        BanSeverity::High => "HIGH",
        BanSeverity::Critical => "CRITICAL",
    }
}

#[async_trait]
impl NotificationSink for Dispatcher {
    async fn notify_ban_created(&self, ip: &str, reason: &str, severity: BanSeverity, auto_banned: bool, at: DateTime<Utc>) {
        let kind = if auto_banned { "auto" } else { "manual" };
        self.dispatch(
            Notification {
                event_type: "ban_created".into(),
                title: format!("IP banned: {ip}"),
                body: format!("{ip} banned ({kind}): {reason}"),
                severity: ban_severity_label(severity).into(),
                cooldown: None,
            },
            at,
        )
        .await;
    }

    /// Spec §9: an auto-expiry unban and a manual unban by a user since
    /// deleted both have `by = None`; we distinguish by presence of `by`,
    /// not a separate flag, preserving that convention end to end.
    async fn notify_ban_cleared(&self, ip: &str, by: Option<&str>, at: DateTime<Utc>) {
        let body = match by {
            Some(who) => format!("{ip} unbanned by {who}"),
            None => format!("{ip} unbanned (expired or by a removed user)"),
        };
        self.dispatch(
            Notification {
                event_type: "ban_removed".into(),
                title: format!("IP unbanned: {ip}"),
                body,
                severity: "NOTICE".into(),
                cooldown: None,
            },
            at,
        )
        .await;
    }

    async fn notify_system_error(&self, component: &str, message: &str, at: DateTime<Utc>) {
        self.dispatch(
            Notification {
                event_type: "system_error".into(),
                title: format!("System error in {component}"),
                body: message.to_string(),
                severity: "ERROR".into(),
                cooldown: None,
            },
            at,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            enabled: true,
            outbound_command: "true".into(),
            command_timeout_secs: 5,
            high_severity_cooldown_secs: 300,
            waf_block_threshold: 5,
            waf_block_threshold_window_secs: 300,
            batching_enabled: false,
            batch_interval_secs: 60,
            daily_report_hour_local: 6,
        }
    }

    async fn dispatcher() -> (Dispatcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store_pool = layer7waf_store::open(&dir.path().join("database.db")).await.unwrap();
        let event_pool = layer7waf_event_store::open(&dir.path().join("waf-events.db")).await.unwrap();
        (Dispatcher::new(config(), store_pool, event_pool), dir)
    }

    #[tokio::test]
    async fn disabled_dispatcher_sends_nothing() {
        let (dispatcher, _dir) = dispatcher().await;
        dispatcher.update_config(DispatcherConfig { enabled: false, ..config() });
        dispatcher
            .dispatch(
                Notification {
                    event_type: "ban_created".into(),
                    title: "t".into(),
                    body: "b".into(),
                    severity: "HIGH".into(),
                    cooldown: None,
                },
                Utc::now(),
            )
            .await;

        let records = layer7waf_store::notifications::list_since(&dispatcher.store_pool, Utc::now() - chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn ban_created_persists_a_sent_record() {
        let (dispatcher, _dir) = dispatcher().await;
        let now = Utc::now();
        dispatcher.notify_ban_created("203.0.113.5", "auto-ban", BanSeverity::High, true, now).await;

        let records = layer7waf_store::notifications::list_since(&dispatcher.store_pool, now - chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "ban_created");
        assert!(matches!(records[0].status, NotificationStatus::Sent));
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_dispatch() {
        let (dispatcher, _dir) = dispatcher().await;
        let now = Utc::now();

        let make = || Notification {
            event_type: "waf_high_severity".into(),
            title: "t".into(),
            body: "b".into(),
            severity: "CRITICAL".into(),
            cooldown: Some(("high_severity_1.2.3.4".into(), chrono::Duration::minutes(5))),
        };

        dispatcher.dispatch(make(), now).await;
        dispatcher.dispatch(make(), now + chrono::Duration::seconds(30)).await;

        let records = layer7waf_store::notifications::list_since(&dispatcher.store_pool, now - chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1, "second dispatch within cooldown must be suppressed");
    }

    #[tokio::test]
    async fn batching_delays_delivery_until_due() {
        let (dispatcher, _dir) = dispatcher().await;
        dispatcher.update_config(DispatcherConfig { batching_enabled: true, batch_interval_secs: 60, ..config() });
        let now = Utc::now();

        dispatcher
            .dispatch(
                Notification {
                    event_type: "ban_created".into(),
                    title: "t".into(),
                    body: "b".into(),
                    severity: "HIGH".into(),
                    cooldown: None,
                },
                now,
            )
            .await;

        assert_eq!(dispatcher.batch_queue.lock().await.len(), 1);
        let records = layer7waf_store::notifications::list_since(&dispatcher.store_pool, now - chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert!(records.is_empty(), "batched notification must not send immediately");
    }

    #[tokio::test]
    async fn waf_block_threshold_fires_once_events_cross_threshold() {
        let (dispatcher, _dir) = dispatcher().await;
        let now = Utc::now();

        let mut event = layer7waf_common::WafEvent {
            id: None,
            proxy_id: None,
            timestamp: now,
            client_ip: "203.0.113.1".into(),
            request_method: "GET".into(),
            request_uri: "/".into(),
            attack_type: "sqli".into(),
            rule_id: "1".into(),
            severity: Severity::Warning,
            message: "m".into(),
            raw_log: "{}".into(),
            blocked: true,
            notified: false,
        };
        let mut events = Vec::new();
        for _ in 0..5 {
            events.push(event.clone());
            event.timestamp = event.timestamp + chrono::Duration::seconds(1);
        }
        layer7waf_event_store::append(&dispatcher.event_store_pool, &events).await.unwrap();

        dispatcher.on_waf_event("203.0.113.1", Severity::Warning, true, now).await;

        let records = layer7waf_store::notifications::list_since(&dispatcher.store_pool, now - chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert!(records.iter().any(|r| r.event_type == "waf_block_threshold"));
    }

    #[tokio::test]
    async fn matrix_rule_fires_when_count_meets_threshold() {
        let (dispatcher, _dir) = dispatcher().await;
        let now = Utc::now();

        matrix::create(
            &dispatcher.store_pool,
            matrix::NewMatrixRule {
                severity_level: Severity::Critical,
                count_threshold: 2,
                time_window_s: 300,
                notification_delay_s: 600,
            },
        )
        .await
        .unwrap();

        let event = layer7waf_common::WafEvent {
            id: None,
            proxy_id: None,
            timestamp: now,
            client_ip: "203.0.113.1".into(),
            request_method: "GET".into(),
            request_uri: "/".into(),
            attack_type: "sqli".into(),
            rule_id: "1".into(),
            severity: Severity::Critical,
            message: "m".into(),
            raw_log: "{}".into(),
            blocked: true,
            notified: false,
        };
        layer7waf_event_store::append(&dispatcher.event_store_pool, &[event.clone(), event]).await.unwrap();

        dispatcher.evaluate_matrix_rules(now).await;

        let records = layer7waf_store::notifications::list_since(&dispatcher.store_pool, now - chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        assert!(records.iter().any(|r| r.event_type == "matrix_rule"));

        let rules = matrix::list_all(&dispatcher.store_pool).await.unwrap();
        assert!(rules[0].last_triggered.is_some());
    }
}
