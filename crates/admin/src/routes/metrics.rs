use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use prometheus::Encoder;

use crate::state::SharedState;

/// Refreshes the gauges that aren't updated inline by their owning route, so
/// a scrape that never hit `/api/ban/bans/stats` still sees live numbers.
async fn refresh_gauges(state: &SharedState) {
    if let Ok(stats) = state.orchestrator.statistics(Utc::now()).await {
        state.metrics.bans_active.set(stats.total_active);
        state.metrics.bans_auto.set(stats.auto_banned);
        state.metrics.bans_manual.set(stats.manual_banned);
        state.metrics.bans_permanent.set(stats.permanent);
        state.metrics.bans_temporary.set(stats.temporary);
        state.metrics.bans_last_24h.set(stats.last_24h);
        for (attack_type, count) in &stats.top_attack_types {
            state.metrics.bans_by_attack_type.with_label_values(&[attack_type]).set(*count);
        }
    }
    state.metrics.sse_subscribers.set(state.event_bus.subscriber_count() as i64);
    state.metrics.uptime_seconds.set(state.start_time.elapsed().as_secs() as i64);
}

/// GET /api/metrics
///
/// Returns all registered Prometheus metrics in the standard text exposition format.
pub async fn get_metrics(State(state): State<SharedState>) -> impl IntoResponse {
    refresh_gauges(&state).await;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let body = String::from_utf8(buffer).unwrap_or_default();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        }
        Err(e) => {
            tracing::error!("failed to encode prometheus metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("failed to encode metrics: {}", e),
            )
        }
    }
}
