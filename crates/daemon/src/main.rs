//! Wires every pipeline component together and runs them until shutdown,
//! the way `proxy/src/main.rs` wires Pingora and the admin background
//! service in the teacher. There is no Pingora here: this binary is the
//! telemetry/detection/ban core, not the proxy itself, so `main` only
//! spawns tokio tasks and runs the admin API to completion.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use layer7waf_admin::AppState;
use layer7waf_audit_ingestor::{AuditIngestor, IngestorConfig, StaticProxyResolver};
use layer7waf_ban_orchestrator::BanOrchestrator;
use layer7waf_common::PipelineConfig;
use layer7waf_detection::DetectionEngine;
use layer7waf_event_bus::{BusEvent, EventBus};
use layer7waf_firewall::{FirewallRegistry, HttpFirewallProvider, NoopProvider};
use layer7waf_notifications::Dispatcher;
use layer7waf_reconciliation::ReconciliationLoop;
use layer7waf_store::integrations::decrypt_credentials;
use layer7waf_store::types::IntegrationProvider;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config/waf-pipeline.yaml".to_string());
    info!(config_path = %config_path, "starting layer7waf pipeline");

    let config = PipelineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, config_path = %config_path, "failed to load configuration, using defaults");
        PipelineConfig::default()
    });

    let store_pool = layer7waf_store::open(&config.ban.store_path)
        .await
        .context("failed to open config store")?;
    let event_store_pool = layer7waf_event_store::open(&config.event_store.path)
        .await
        .context("failed to open WAF event store")?;

    let whitelist_entries = layer7waf_store::whitelist::list_all(&store_pool)
        .await
        .context("failed to load whitelist")?;
    let whitelist = Arc::new(layer7waf_ip_policy::WhitelistStore::from_entries(whitelist_entries));

    let registry = build_firewall_registry(&store_pool).await?;
    if registry.is_empty() {
        warn!("no enabled integrations configured; bans will not propagate upstream");
    }

    let event_bus = Arc::new(EventBus::new());
    let dispatcher = Arc::new(Dispatcher::new(config.notifications.clone().into(), store_pool.clone(), event_store_pool.clone()));

    let orchestrator = Arc::new(BanOrchestrator::new(
        store_pool.clone(),
        whitelist.clone(),
        &registry,
        event_bus.clone(),
        dispatcher.clone(),
        config.ban.provider_rps,
    ));
    let reconciliation = Arc::new(ReconciliationLoop::new(registry, orchestrator.clone()));

    let resolver = Arc::new(StaticProxyResolver::new(Vec::new()));
    let ingestor = Arc::new(AuditIngestor::new(
        IngestorConfig::from(&config.audit_log),
        event_store_pool.clone(),
        resolver,
        event_bus.clone(),
    ));

    let detection = Arc::new(DetectionEngine::new(
        (&config.detection).into(),
        event_store_pool.clone(),
        store_pool.clone(),
        whitelist,
        orchestrator.clone(),
    ));

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    spawn(&mut tasks, "audit-ingestor", {
        let ingestor = ingestor.clone();
        let cancel = cancel.clone();
        async move { ingestor.run(cancel).await }
    });
    spawn(&mut tasks, "audit-ingestor-backfill", {
        let ingestor = ingestor.clone();
        let cancel = cancel.clone();
        async move { ingestor.run_backfill_loop(cancel).await }
    });
    spawn(&mut tasks, "detection-engine", {
        let detection = detection.clone();
        let cancel = cancel.clone();
        async move { detection.run(cancel).await }
    });
    spawn(&mut tasks, "ban-expiry-sweep", {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        let interval = config.ban.expiry_sweep_interval_secs;
        async move { orchestrator.run_expiry_sweep_loop(interval, cancel).await }
    });
    spawn(&mut tasks, "reconciliation", {
        let reconciliation = reconciliation.clone();
        let cancel = cancel.clone();
        let interval = config.reconciliation.interval_secs;
        async move { reconciliation.run_loop(interval, cancel).await }
    });
    spawn(&mut tasks, "notification-batch-worker", {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        async move { dispatcher.run_batch_worker(cancel).await }
    });
    spawn(&mut tasks, "notification-matrix-scheduler", {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        async move { dispatcher.run_matrix_rule_scheduler(cancel).await }
    });
    spawn(&mut tasks, "notification-daily-report", {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        async move { dispatcher.run_daily_report_scheduler(cancel).await }
    });
    spawn(&mut tasks, "event-store-purge", {
        let pool = event_store_pool.clone();
        let cancel = cancel.clone();
        let retention_days = config.event_store.retention_days;
        let purge_hour_local = config.event_store.purge_hour_local;
        async move { layer7waf_event_store::run_purge_loop(pool, retention_days, purge_hour_local, cancel).await }
    });
    spawn(&mut tasks, "waf-event-notification-bridge", {
        let bus = event_bus.clone();
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        async move { bridge_waf_events_to_dispatcher(bus, dispatcher, cancel).await }
    });

    let state: layer7waf_admin::SharedStateType = Arc::new(AppState::new(orchestrator.clone(), reconciliation, dispatcher, event_bus));
    let admin_listen = config.admin.listen.clone();

    tokio::select! {
        result = layer7waf_admin::run_admin_server(state, &admin_listen) => {
            if let Err(e) = result {
                error!(error = %e, "admin API server exited with an error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining background tasks");
        }
    }

    info!("stopping ban queue: no new upstream ops accepted, draining in-flight calls");
    orchestrator.begin_shutdown();
    cancel.cancel();

    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "background task panicked during shutdown");
        }
    }

    store_pool.close().await;
    event_store_pool.close().await;
    info!("layer7waf pipeline stopped");
    Ok(())
}

/// Builds the firewall registry from every enabled `Integration` row,
/// decrypting credentials and constructing the matching client. Non-noop
/// providers store their credentials as a JSON object `{"base_url",
/// "token"}`; a malformed or undecryptable entry is skipped with a warning
/// rather than failing startup, since a single broken integration shouldn't
/// take the whole pipeline down.
async fn build_firewall_registry(store_pool: &sqlx::SqlitePool) -> Result<FirewallRegistry> {
    #[derive(serde::Deserialize)]
    struct HttpCredentials {
        base_url: String,
        token: String,
    }

    let mut registry = FirewallRegistry::new();
    let integrations = layer7waf_store::integrations::list_enabled(store_pool)
        .await
        .context("failed to load integrations")?;

    for integration in integrations {
        let Some(provider_kind) = IntegrationProvider::parse(&integration.provider) else {
            warn!(integration_id = integration.id, provider = %integration.provider, "unknown integration provider, skipping");
            continue;
        };

        let provider: Arc<dyn layer7waf_firewall::FirewallProvider> = match provider_kind {
            IntegrationProvider::Noop => Arc::new(NoopProvider::new()),
            _ => {
                let creds = match decrypt_credentials(&integration) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(integration_id = integration.id, error = %e, "failed to decrypt integration credentials, skipping");
                        continue;
                    }
                };
                let parsed: HttpCredentials = match serde_json::from_str(&creds) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(integration_id = integration.id, error = %e, "integration credentials are not valid {{base_url, token}} JSON, skipping");
                        continue;
                    }
                };
                Arc::new(HttpFirewallProvider::new(integration.provider.clone(), parsed.base_url, parsed.token))
            }
        };

        registry.register(integration.id, provider);
    }

    Ok(registry)
}

/// Forwards every ingested WAF event to the dispatcher's trigger evaluation
/// (spec §4.9 "WAF block" and "WAF high-severity" triggers). Kept at the
/// daemon level, subscribing to the bus like the admin SSE handler does,
/// rather than as a direct dependency from the ingestor onto notifications
/// — the ingestor stays ignorant of what else consumes its events.
async fn bridge_waf_events_to_dispatcher(bus: Arc<EventBus>, dispatcher: Arc<Dispatcher>, cancel: CancellationToken) {
    let mut rx = bus.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(BusEvent::WafEvent { event }) => {
                        dispatcher.on_waf_event(&event.client_ip, event.severity, event.blocked, event.timestamp).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification bridge lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    info!("waf-event notification bridge stopped");
}

fn spawn<F>(tasks: &mut Vec<(&'static str, tokio::task::JoinHandle<()>)>, name: &'static str, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tasks.push((name, tokio::spawn(fut)));
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
