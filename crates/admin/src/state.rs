use std::sync::Arc;
use std::time::Instant;

use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};

use layer7waf_ban_orchestrator::BanOrchestrator;
use layer7waf_event_bus::EventBus;
use layer7waf_notifications::Dispatcher;
use layer7waf_reconciliation::ReconciliationLoop;

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// Central application state: handles to every long-running component the
/// admin API fronts. Each component owns its own store pool handle and
/// background tasks; this crate only calls into them.
pub struct AppState {
    pub orchestrator: Arc<BanOrchestrator>,
    pub reconciliation: Arc<ReconciliationLoop>,
    pub dispatcher: Arc<Dispatcher>,
    pub event_bus: Arc<EventBus>,
    pub metrics: WafMetrics,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<BanOrchestrator>,
        reconciliation: Arc<ReconciliationLoop>,
        dispatcher: Arc<Dispatcher>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            orchestrator,
            reconciliation,
            dispatcher,
            event_bus,
            metrics: WafMetrics::new(),
            start_time: Instant::now(),
        }
    }
}

/// Prometheus gauges reflecting current pipeline state, refreshed at scrape
/// time rather than incremented inline (spec §1.1 "Metrics" - a registry
/// scoped to this pipeline, not the outer HTTP/TLS surface).
pub struct WafMetrics {
    pub registry: Registry,
    pub bans_active: IntGauge,
    pub bans_auto: IntGauge,
    pub bans_manual: IntGauge,
    pub bans_permanent: IntGauge,
    pub bans_temporary: IntGauge,
    pub bans_last_24h: IntGauge,
    pub bans_by_attack_type: IntGaugeVec,
    pub sse_subscribers: IntGauge,
    pub uptime_seconds: IntGauge,
}

impl WafMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let bans_active = IntGauge::with_opts(Opts::new("waf_bans_active", "Currently active bans"))
            .expect("failed to create bans_active gauge");
        let bans_auto = IntGauge::with_opts(Opts::new("waf_bans_auto", "Active bans issued automatically by the detection engine"))
            .expect("failed to create bans_auto gauge");
        let bans_manual = IntGauge::with_opts(Opts::new("waf_bans_manual", "Active bans issued by an operator"))
            .expect("failed to create bans_manual gauge");
        let bans_permanent = IntGauge::with_opts(Opts::new("waf_bans_permanent", "Active bans with no expiry"))
            .expect("failed to create bans_permanent gauge");
        let bans_temporary = IntGauge::with_opts(Opts::new("waf_bans_temporary", "Active bans with an expiry"))
            .expect("failed to create bans_temporary gauge");
        let bans_last_24h = IntGauge::with_opts(Opts::new("waf_bans_last_24h", "Bans issued in the last 24 hours"))
            .expect("failed to create bans_last_24h gauge");
        let bans_by_attack_type = IntGaugeVec::new(
            Opts::new("waf_bans_by_attack_type", "Active bans grouped by attack type (top 5)"),
            &["attack_type"],
        )
        .expect("failed to create bans_by_attack_type gauge vec");
        let sse_subscribers = IntGauge::with_opts(Opts::new("waf_sse_subscribers", "Connected admin event-stream subscribers"))
            .expect("failed to create sse_subscribers gauge");
        let uptime_seconds = IntGauge::with_opts(Opts::new("waf_admin_uptime_seconds", "Seconds since the admin API process started"))
            .expect("failed to create uptime_seconds gauge");

        registry.register(Box::new(bans_active.clone())).expect("failed to register bans_active");
        registry.register(Box::new(bans_auto.clone())).expect("failed to register bans_auto");
        registry.register(Box::new(bans_manual.clone())).expect("failed to register bans_manual");
        registry.register(Box::new(bans_permanent.clone())).expect("failed to register bans_permanent");
        registry.register(Box::new(bans_temporary.clone())).expect("failed to register bans_temporary");
        registry.register(Box::new(bans_last_24h.clone())).expect("failed to register bans_last_24h");
        registry.register(Box::new(bans_by_attack_type.clone())).expect("failed to register bans_by_attack_type");
        registry.register(Box::new(sse_subscribers.clone())).expect("failed to register sse_subscribers");
        registry.register(Box::new(uptime_seconds.clone())).expect("failed to register uptime_seconds");

        Self {
            registry,
            bans_active,
            bans_auto,
            bans_manual,
            bans_permanent,
            bans_temporary,
            bans_last_24h,
            bans_by_attack_type,
            sse_subscribers,
            uptime_seconds,
        }
    }
}

impl Default for WafMetrics {
    fn default() -> Self {
        Self::new()
    }
}
