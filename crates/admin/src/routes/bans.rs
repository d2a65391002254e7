use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use layer7waf_ban_orchestrator::BanOptions;
use layer7waf_common::BanSeverity;
use layer7waf_store::bans;

use crate::error::{not_found, refusal_response, ApiError};
use crate::state::SharedState;

/// GET /api/ban/bans
pub async fn list_bans(State(state): State<SharedState>) -> Result<Json<Vec<layer7waf_store::Ban>>, ApiError> {
    let pool = state.orchestrator.store_pool();
    let active = bans::list_active(&pool, Utc::now()).await?;
    Ok(Json(active))
}

#[derive(Debug, Deserialize)]
pub struct CreateBanRequest {
    pub ip_address: String,
    pub reason: String,
    #[serde(default)]
    pub attack_type: Option<String>,
    #[serde(default = "default_severity")]
    pub severity: BanSeverity,
    #[serde(default)]
    pub duration_s: Option<i64>,
    #[serde(default)]
    pub banned_by: Option<String>,
}

fn default_severity() -> BanSeverity {
    BanSeverity::Medium
}

/// POST /api/ban/bans - operator-issued manual ban.
pub async fn create_ban(State(state): State<SharedState>, Json(req): Json<CreateBanRequest>) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let opts = BanOptions {
        reason: req.reason,
        attack_type: req.attack_type,
        event_count: 0,
        severity: req.severity,
        duration_s: req.duration_s,
        auto_banned: false,
        banned_by: Some(req.banned_by.unwrap_or_else(|| "admin".to_string())),
        proxy_id: None,
        detection_rule_id: None,
        sample_events: Vec::new(),
    };

    match state.orchestrator.ban(&req.ip_address, opts, now).await? {
        layer7waf_common::Outcome::Ok(created) => Ok(Json(json!({
            "ban_id": created.ban_id,
            "queued_integrations": created.queued_integrations,
        }))),
        layer7waf_common::Outcome::Refused(r) => Err(refusal_response(&r)),
    }
}

async fn resolve_ip(state: &SharedState, id: i64) -> Result<String, ApiError> {
    let pool = state.orchestrator.store_pool();
    let ban = bans::get(&pool, id).await?.ok_or_else(|| not_found(format!("no ban #{id}")))?;
    Ok(ban.ip_address)
}

/// DELETE /api/ban/bans/{id}
pub async fn delete_ban(State(state): State<SharedState>, Path(id): Path<i64>) -> Result<Json<Value>, ApiError> {
    let ip = resolve_ip(&state, id).await?;
    let now = Utc::now();
    match state.orchestrator.unban(&ip, Some("admin"), now).await? {
        layer7waf_common::Outcome::Ok(()) => Ok(Json(json!({ "unbanned": true }))),
        layer7waf_common::Outcome::Refused(r) => Err(refusal_response(&r)),
    }
}

/// POST /api/ban/bans/{id}/permanent
pub async fn make_permanent(State(state): State<SharedState>, Path(id): Path<i64>) -> Result<Json<Value>, ApiError> {
    let ip = resolve_ip(&state, id).await?;
    let now = Utc::now();
    match state.orchestrator.make_permanent(&ip, now).await? {
        layer7waf_common::Outcome::Ok(()) => Ok(Json(json!({ "permanent": true }))),
        layer7waf_common::Outcome::Refused(r) => Err(refusal_response(&r)),
    }
}

/// GET /api/ban/bans/stats
pub async fn ban_stats(State(state): State<SharedState>) -> Result<Json<bans::BanStatistics>, ApiError> {
    let stats = state.orchestrator.statistics(Utc::now()).await?;

    state.metrics.bans_active.set(stats.total_active);
    state.metrics.bans_auto.set(stats.auto_banned);
    state.metrics.bans_manual.set(stats.manual_banned);
    state.metrics.bans_permanent.set(stats.permanent);
    state.metrics.bans_temporary.set(stats.temporary);
    state.metrics.bans_last_24h.set(stats.last_24h);
    for (attack_type, count) in &stats.top_attack_types {
        state.metrics.bans_by_attack_type.with_label_values(&[attack_type]).set(*count);
    }

    Ok(Json(stats))
}

/// POST /api/ban/bans/sync - reconcile every active ban against every
/// registered firewall provider (spec §4.6 `Reconcile`).
pub async fn sync_all(State(state): State<SharedState>) -> Result<Json<layer7waf_reconciliation::SyncReport>, ApiError> {
    let report = state.reconciliation.sync_all(Utc::now()).await?;
    Ok(Json(report))
}

/// POST /api/ban/bans/sync/{ip} - reconcile a single IP.
pub async fn sync_one(State(state): State<SharedState>, Path(ip): Path<String>) -> Result<Json<layer7waf_reconciliation::SyncReport>, ApiError> {
    let report = state.reconciliation.sync_ip(&ip, Utc::now()).await?;
    Ok(Json(report))
}

/// GET /api/ban/bans/sync-status
pub async fn sync_status(State(state): State<SharedState>) -> Json<Value> {
    let running = state.reconciliation.is_running();
    let last = state.reconciliation.last_status().await;
    Json(json!({
        "running": running,
        "last": last,
    }))
}
