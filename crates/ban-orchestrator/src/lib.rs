//! Ban orchestrator (spec §4.5): whitelist-gated ban/unban, provider fan-out
//! through the per-integration ban queue, expiry sweeps, and statistics.
//! Constructed with `Arc<dyn NotificationSink>` and `Arc<dyn EventPublisher>`
//! trait objects so this crate never depends on the concrete notification
//! dispatcher or event bus, breaking the orchestrator <-> notifications <->
//! bus cycle described in spec §9.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{error, info};

use layer7waf_ban_queue::{BanQueue, OpKind, QueueSink, QueuedOp};
use layer7waf_common::{BanSeverity, Layer7Error, Outcome, Refusal};
use layer7waf_event_bus::{BusEvent, EventPublisher};
use layer7waf_firewall::FirewallRegistry;
use layer7waf_ip_policy::WhitelistStore;
use layer7waf_notifications::NotificationSink;
use layer7waf_store::bans::BanStatistics;
use layer7waf_store::{Ban, IntegrationNotified, NewBan};

/// Caller-supplied parameters for a new ban (spec §4.5 `Ban`).
#[derive(Debug, Clone)]
pub struct BanOptions {
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

#[derive(Debug, Clone)]
pub struct BanCreated {
    pub ban_id: i64,
    pub queued_integrations: usize,
}

/// Receives ban-queue completion callbacks. Kept as its own type (rather
/// than implemented directly on `BanOrchestrator`) so it can be constructed
/// and handed to `BanQueue::register` before the orchestrator itself, which
/// owns the queue, exists.
struct OrchestratorSink {
    store_pool: SqlitePool,
    event_bus: Arc<dyn EventPublisher>,
    notifier: Arc<dyn NotificationSink>,
}

#[async_trait]
impl QueueSink for OrchestratorSink {
    async fn on_ban_succeeded(&self, ban_id: i64, integration_id: i64, provider_ban_id: Option<String>) {
        let now = Utc::now();
        if let Err(e) = layer7waf_store::bans::record_integration_notified(
            &self.store_pool,
            ban_id,
            IntegrationNotified { integration_id, provider_ban_id, notified_at: now },
        )
        .await
        {
            error!(ban_id, integration_id, error = %e, "failed to record integration notification");
        }
    }

    async fn on_unban_succeeded(&self, ban_id: i64, integration_id: i64) {
        info!(ban_id, integration_id, "provider confirmed unban");
    }

    async fn on_op_exhausted(&self, op: &QueuedOp, last_error: String) {
        self.notifier
            .notify_system_error(
                "ban_queue",
                &format!("integration {} exhausted retries for {}: {last_error}", op.integration_id, op.ip),
                Utc::now(),
            )
            .await;
    }
}

pub struct BanOrchestrator {
    store_pool: SqlitePool,
    whitelist: Arc<WhitelistStore>,
    ban_queue: BanQueue,
    event_bus: Arc<dyn EventPublisher>,
    notifier: Arc<dyn NotificationSink>,
}

impl BanOrchestrator {
    /// Registers every enabled integration from `registry` with the ban
    /// queue at `rate_per_sec`, sharing one `OrchestratorSink` across all of
    /// them.
    pub fn new(
        store_pool: SqlitePool,
        whitelist: Arc<WhitelistStore>,
        registry: &FirewallRegistry,
        event_bus: Arc<dyn EventPublisher>,
        notifier: Arc<dyn NotificationSink>,
        rate_per_sec: u64,
    ) -> Self {
        let sink = Arc::new(OrchestratorSink {
            store_pool: store_pool.clone(),
            event_bus: event_bus.clone(),
            notifier: notifier.clone(),
        });

        let mut ban_queue = BanQueue::new();
        for integration_id in registry.integration_ids() {
            if let Some(provider) = registry.get(integration_id) {
                ban_queue.register(integration_id, provider, sink.clone(), rate_per_sec);
            }
        }

        Self { store_pool, whitelist, ban_queue, event_bus, notifier }
    }

    pub fn registered_integrations(&self) -> Vec<i64> {
        self.ban_queue.registered_integrations()
    }

    /// Spec §5 graceful shutdown: stop accepting new queue work so every
    /// per-integration worker starts its bounded drain. Safe to call with
    /// the orchestrator still shared via `Arc` elsewhere.
    pub fn begin_shutdown(&self) {
        self.ban_queue.begin_shutdown();
    }

    /// Cheap handle to the config-side store pool, for collaborators (the
    /// reconciliation loop, the admin crate) that need read access without
    /// routing every query through the orchestrator.
    pub fn store_pool(&self) -> SqlitePool {
        self.store_pool.clone()
    }

    /// Shared handle to the hot-reloadable whitelist snapshot, for
    /// collaborators (the admin crate) that write whitelist rows and must
    /// push the change into every reader without a restart.
    pub fn whitelist(&self) -> Arc<WhitelistStore> {
        self.whitelist.clone()
    }

    /// Lets the reconciliation loop repair a missing upstream rule through
    /// the same per-integration queue normal bans use, so repair ops and
    /// live bans on the same IP still serialise (spec §4.6).
    pub async fn enqueue_repair_ban(
        &self,
        ban_id: i64,
        integration_id: i64,
        ip: &str,
        reason: String,
        duration_s: Option<i64>,
        severity: BanSeverity,
    ) -> Result<(), Layer7Error> {
        self.ban_queue
            .enqueue(QueuedOp {
                ban_id,
                integration_id,
                ip: ip.to_string(),
                kind: OpKind::Ban { reason, duration_s, severity },
            })
            .await
    }

    /// Lets the reconciliation loop clear an upstream rule that has no
    /// corresponding active DB ban (spec §4.6 "Extra"). `ban_id` is a
    /// sentinel (0) in that case since there is no local row to associate.
    pub async fn enqueue_repair_unban(
        &self,
        ban_id: i64,
        integration_id: i64,
        ip: &str,
        provider_ban_id: Option<String>,
    ) -> Result<(), Layer7Error> {
        self.ban_queue
            .enqueue(QueuedOp { ban_id, integration_id, ip: ip.to_string(), kind: OpKind::Unban { provider_ban_id } })
            .await
    }

    /// Spec §4.5 `Ban`.
    pub async fn ban(&self, ip: &str, opts: BanOptions, now: DateTime<Utc>) -> Result<Outcome<BanCreated>, Layer7Error> {
        let addr = IpAddr::from_str(ip).map_err(|_| Layer7Error::validation(format!("invalid IP address: {ip}")))?;

        if let Some(entry) = self.whitelist.find_match(addr) {
            return Ok(Outcome::Refused(Refusal::Whitelisted { matched_rule: entry.label() }));
        }

        if let Some(existing) = layer7waf_store::bans::find_active_by_ip(&self.store_pool, ip, now).await? {
            return Ok(Outcome::Refused(Refusal::AlreadyBanned { existing_ban_id: existing.id }));
        }

        let new_ban = NewBan {
            ip_address: ip.to_string(),
            reason: opts.reason.clone(),
            attack_type: opts.attack_type,
            event_count: opts.event_count,
            severity: opts.severity,
            duration_s: opts.duration_s,
            auto_banned: opts.auto_banned,
            banned_by: opts.banned_by,
            proxy_id: opts.proxy_id,
            detection_rule_id: opts.detection_rule_id,
            sample_events: opts.sample_events,
        };
        let ban = layer7waf_store::bans::create(&self.store_pool, new_ban, now).await?;

        let integrations = self.registered_integrations();
        for integration_id in &integrations {
            let op = QueuedOp {
                ban_id: ban.id,
                integration_id: *integration_id,
                ip: ip.to_string(),
                kind: OpKind::Ban { reason: opts.reason.clone(), duration_s: ban.expires_at.map(|e| (e - now).num_seconds().max(0)), severity: ban.severity },
            };
            if let Err(e) = self.ban_queue.enqueue(op).await {
                error!(ban_id = ban.id, integration_id, error = %e, "failed to enqueue ban op");
            }
        }

        self.event_bus
            .publish(BusEvent::BanCreated { ban_id: ban.id, ip: ip.to_string(), auto_banned: ban.auto_banned, at: now })
            .await;
        self.notifier.notify_ban_created(ip, &ban.reason, ban.severity, ban.auto_banned, now).await;

        Ok(Outcome::Ok(BanCreated { ban_id: ban.id, queued_integrations: integrations.len() }))
    }

    /// Spec §4.5 `Unban`.
    pub async fn unban(&self, ip: &str, by: Option<&str>, now: DateTime<Utc>) -> Result<Outcome<()>, Layer7Error> {
        let ban = match layer7waf_store::bans::find_active_by_ip(&self.store_pool, ip, now).await? {
            Some(ban) => ban,
            None => return Ok(Outcome::Refused(Refusal::NotBanned)),
        };

        layer7waf_store::bans::set_unbanned(&self.store_pool, ban.id, now, by).await?;
        self.enqueue_unbans(&ban).await;

        self.event_bus.publish(BusEvent::BanRemoved { ban_id: ban.id, ip: ip.to_string(), at: now }).await;
        self.notifier.notify_ban_cleared(ip, by, now).await;

        Ok(Outcome::Ok(()))
    }

    async fn enqueue_unbans(&self, ban: &Ban) {
        for entry in &ban.integrations_notified {
            let op = QueuedOp {
                ban_id: ban.id,
                integration_id: entry.integration_id,
                ip: ban.ip_address.clone(),
                kind: OpKind::Unban { provider_ban_id: entry.provider_ban_id.clone() },
            };
            if let Err(e) = self.ban_queue.enqueue(op).await {
                error!(ban_id = ban.id, integration_id = entry.integration_id, error = %e, "failed to enqueue unban op");
            }
        }
    }

    /// Spec §4.5 `MakePermanent`: clears `expires_at` and re-issues a
    /// provider ban with `duration=None` for every previously notified
    /// integration, converting the upstream rule from temporary to
    /// permanent. Providers are idempotent on `Ban` (spec §4.3), so
    /// re-issuing is safe even though the IP is already banned upstream.
    pub async fn make_permanent(&self, ip: &str, now: DateTime<Utc>) -> Result<Outcome<()>, Layer7Error> {
        let ban = match layer7waf_store::bans::find_active_by_ip(&self.store_pool, ip, now).await? {
            Some(ban) => ban,
            None => return Ok(Outcome::Refused(Refusal::NotBanned)),
        };

        layer7waf_store::bans::make_permanent(&self.store_pool, ban.id).await?;

        for entry in &ban.integrations_notified {
            let op = QueuedOp {
                ban_id: ban.id,
                integration_id: entry.integration_id,
                ip: ip.to_string(),
                kind: OpKind::Ban { reason: ban.reason.clone(), duration_s: None, severity: ban.severity },
            };
            if let Err(e) = self.ban_queue.enqueue(op).await {
                error!(ban_id = ban.id, integration_id = entry.integration_id, error = %e, "failed to enqueue make-permanent op");
            }
        }

        self.event_bus.publish(BusEvent::BanUpdated { ban_id: ban.id, ip: ip.to_string(), at: now }).await;
        Ok(Outcome::Ok(()))
    }

    /// Spec §4.5 `ExpirySweep`, run every `ban.expiry_sweep_interval_secs`.
    /// Returns the number of bans swept.
    pub async fn expiry_sweep(&self, now: DateTime<Utc>) -> Result<usize, Layer7Error> {
        let expired = layer7waf_store::bans::list_expired(&self.store_pool, now).await?;
        for ban in &expired {
            layer7waf_store::bans::set_unbanned(&self.store_pool, ban.id, now, None).await?;
            self.enqueue_unbans(ban).await;
            self.event_bus.publish(BusEvent::BanRemoved { ban_id: ban.id, ip: ban.ip_address.clone(), at: now }).await;
            self.notifier.notify_ban_cleared(&ban.ip_address, None, now).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expiry sweep unbanned stale bans");
        }
        Ok(expired.len())
    }

    /// Spec §4.5 `GetStatistics`.
    pub async fn statistics(&self, now: DateTime<Utc>) -> Result<BanStatistics, Layer7Error> {
        layer7waf_store::bans::statistics(&self.store_pool, now).await
    }

    /// Runs `expiry_sweep` on a fixed interval until `cancel` fires.
    pub async fn run_expiry_sweep_loop(&self, interval_secs: u64, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            if let Err(e) = self.expiry_sweep(Utc::now()).await {
                error!(error = %e, "expiry sweep failed");
            }
        }
        info!("expiry sweep loop stopped");
    }
}
