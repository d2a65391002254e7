//! Reconciliation loop (spec §4.6): periodically diffs each integration's
//! upstream rule set against the local database and repairs both
//! directions. Runs through `layer7waf-ban-orchestrator`'s ban queue so
//! repair ops serialise with live ban/unban traffic on the same IP
//! (spec §5).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use layer7waf_ban_orchestrator::BanOrchestrator;
use layer7waf_common::Layer7Error;
use layer7waf_firewall::FirewallRegistry;

/// Result of one reconciliation pass, returned to the admin API's
/// `sync`/`sync/:ip` endpoints (spec §6).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncReport {
    pub integrations_checked: usize,
    pub missing_reissued: usize,
    pub extra_unbanned: usize,
    pub expired_swept: usize,
}

/// Dropping this flips the guard flag back, regardless of how the holding
/// call returns (including `?` early exits).
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn try_claim(running: &AtomicBool) -> Option<RunGuard<'_>> {
    running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .ok()
        .map(|_| RunGuard(running))
}

/// Periodic DB-vs-provider diff/repair loop plus operator-callable
/// `sync_ip`/`sync_all` variants (spec §4.6).
/// A completed pass plus when it finished, for the admin API's
/// `GET /api/ban/bans/sync-status` (spec §6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct LastSyncStatus {
    pub report: SyncReport,
    pub completed_at: DateTime<Utc>,
}

pub struct ReconciliationLoop {
    registry: FirewallRegistry,
    orchestrator: Arc<BanOrchestrator>,
    running: AtomicBool,
    last_status: tokio::sync::RwLock<Option<LastSyncStatus>>,
}

impl ReconciliationLoop {
    pub fn new(registry: FirewallRegistry, orchestrator: Arc<BanOrchestrator>) -> Self {
        Self { registry, orchestrator, running: AtomicBool::new(false), last_status: tokio::sync::RwLock::new(None) }
    }

    /// Whether a pass is in flight right now.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The most recently completed pass, if any have run yet.
    pub async fn last_status(&self) -> Option<LastSyncStatus> {
        self.last_status.read().await.clone()
    }

    /// Spec §4.6 step 6 `SyncAll`. Only one reconciliation pass runs at a
    /// time per process; a concurrent call is refused rather than queued,
    /// since the next scheduled tick will cover the same ground.
    pub async fn sync_all(&self, now: DateTime<Utc>) -> Result<SyncReport, Layer7Error> {
        let _guard = try_claim(&self.running)
            .ok_or_else(|| Layer7Error::transient("reconciliation already running"))?;
        self.run_pass(None, now).await
    }

    /// Spec §4.6 step 6 `SyncIp`: the same pass, scoped to one IP.
    pub async fn sync_ip(&self, ip: &str, now: DateTime<Utc>) -> Result<SyncReport, Layer7Error> {
        let _guard = try_claim(&self.running)
            .ok_or_else(|| Layer7Error::transient("reconciliation already running"))?;
        self.run_pass(Some(ip), now).await
    }

    async fn run_pass(&self, ip_filter: Option<&str>, now: DateTime<Utc>) -> Result<SyncReport, Layer7Error> {
        // Step 5: expired sweep runs before the per-integration pass, as a
        // second safety net alongside the orchestrator's own scheduled sweep.
        let expired_swept = self.orchestrator.expiry_sweep(now).await?;

        let mut report = SyncReport { expired_swept, ..Default::default() };

        for integration_id in self.orchestrator.registered_integrations() {
            let Some(provider) = self.registry.get(integration_id) else {
                warn!(integration_id, "orchestrator has a queue for an integration missing from the registry");
                continue;
            };
            report.integrations_checked += 1;

            let active = layer7waf_store::bans::list_active(&self.orchestrator.store_pool(), now).await?;
            let active_ips: HashSet<&str> = active.iter().map(|b| b.ip_address.as_str()).collect();
            let notified: Vec<&layer7waf_store::Ban> = active
                .iter()
                .filter(|b| b.integrations_notified.iter().any(|e| e.integration_id == integration_id))
                .collect();

            let provider_bans = match provider.list_bans().await {
                Ok(bans) => bans,
                Err(e) => {
                    error!(integration_id, error = %e, "reconciliation could not list provider bans");
                    continue;
                }
            };
            let provider_ips: HashSet<&str> = provider_bans.iter().map(|b| b.ip.as_str()).collect();

            // Missing: D_notified[integration] but not in P.
            for ban in &notified {
                if let Some(f) = ip_filter {
                    if f != ban.ip_address {
                        continue;
                    }
                }
                if provider_ips.contains(ban.ip_address.as_str()) {
                    continue;
                }
                let duration_s = ban.expires_at.map(|e| (e - now).num_seconds().max(0));
                match self
                    .orchestrator
                    .enqueue_repair_ban(ban.id, integration_id, &ban.ip_address, ban.reason.clone(), duration_s, ban.severity)
                    .await
                {
                    Ok(()) => {
                        info!(integration_id, ip = %ban.ip_address, "reconciliation re-issued missing provider ban");
                        report.missing_reissued += 1;
                    }
                    Err(e) => error!(integration_id, ip = %ban.ip_address, error = %e, "failed to enqueue repair ban"),
                }
            }

            // Extra: in P but ip has no active DB ban at all.
            for pban in &provider_bans {
                if let Some(f) = ip_filter {
                    if f != pban.ip {
                        continue;
                    }
                }
                if active_ips.contains(pban.ip.as_str()) {
                    continue;
                }
                match self
                    .orchestrator
                    .enqueue_repair_unban(0, integration_id, &pban.ip, pban.provider_ban_id.clone())
                    .await
                {
                    Ok(()) => {
                        info!(integration_id, ip = %pban.ip, "reconciliation cleared orphaned provider ban");
                        report.extra_unbanned += 1;
                    }
                    Err(e) => error!(integration_id, ip = %pban.ip, error = %e, "failed to enqueue repair unban"),
                }
            }
        }

        *self.last_status.write().await = Some(LastSyncStatus { report: report.clone(), completed_at: now });
        Ok(report)
    }

    /// Runs `sync_all` on a fixed interval until `cancel` fires.
    pub async fn run_loop(&self, interval_secs: u64, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            match self.sync_all(Utc::now()).await {
                Ok(report) => info!(
                    checked = report.integrations_checked,
                    reissued = report.missing_reissued,
                    cleared = report.extra_unbanned,
                    "reconciliation pass complete"
                ),
                Err(e) => warn!(error = %e, "reconciliation pass skipped or failed"),
            }
        }
        info!("reconciliation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layer7waf_ban_orchestrator::BanOptions;
    use layer7waf_common::BanSeverity;
    use layer7waf_firewall::{FirewallProvider, NoopProvider};
    use layer7waf_notifications::NullSink;
    use std::time::Duration;

    async fn setup() -> (ReconciliationLoop, Arc<NoopProvider>, Arc<BanOrchestrator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = layer7waf_store::open(&dir.path().join("database.db")).await.unwrap();

        let provider = Arc::new(NoopProvider::new());
        let mut registry = FirewallRegistry::new();
        registry.register(1, provider.clone() as Arc<dyn FirewallProvider>);

        let orchestrator = Arc::new(BanOrchestrator::new(
            pool,
            Arc::new(layer7waf_ip_policy::WhitelistStore::new()),
            &registry,
            Arc::new(layer7waf_event_bus::EventBus::new()),
            Arc::new(NullSink),
            50,
        ));

        let recon = ReconciliationLoop::new(registry, orchestrator.clone());
        (recon, provider, orchestrator, dir)
    }

    fn opts() -> BanOptions {
        BanOptions {
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
    async fn missing_provider_rule_is_reissued() {
        let (recon, provider, orchestrator, _dir) = setup().await;
        let now = Utc::now();

        orchestrator.ban("203.0.113.10", opts(), now).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        provider.unban("203.0.113.10", None).await.unwrap();
        assert!(provider.list_bans().await.unwrap().is_empty());

        let report = recon.sync_all(now).await.unwrap();
        assert_eq!(report.missing_reissued, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let listed = provider.list_bans().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ip, "203.0.113.10");
    }

    #[tokio::test]
    async fn orphaned_provider_rule_is_cleared() {
        let (recon, provider, _orchestrator, _dir) = setup().await;
        let now = Utc::now();

        provider
            .ban(layer7waf_firewall::BanRequest {
                ip: "198.51.100.20".into(),
                reason: "external rule".into(),
                duration_s: None,
                severity: BanSeverity::Medium,
            })
            .await
            .unwrap();

        let report = recon.sync_all(now).await.unwrap();
        assert_eq!(report.extra_unbanned, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(provider.list_bans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_all_is_a_noop_when_nothing_diverged() {
        let (recon, _provider, orchestrator, _dir) = setup().await;
        let now = Utc::now();

        orchestrator.ban("203.0.113.11", opts(), now).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let first = recon.sync_all(now).await.unwrap();
        assert_eq!(first.missing_reissued, 0);
        assert_eq!(first.extra_unbanned, 0);

        let second = recon.sync_all(now).await.unwrap();
        assert_eq!(second.missing_reissued, 0);
        assert_eq!(second.extra_unbanned, 0);
    }

    #[test]
    fn concurrency_guard_refuses_a_second_claim_while_the_first_is_held() {
        let flag = AtomicBool::new(false);
        let first = try_claim(&flag);
        assert!(first.is_some());
        assert!(try_claim(&flag).is_none());
        drop(first);
        assert!(try_claim(&flag).is_some());
    }
}
