use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use layer7waf_common::{Layer7Error, Outcome};
use layer7waf_ip_policy::WhitelistType;
use layer7waf_store::whitelist::{self, NewWhitelistEntry};

use crate::error::{refusal_response, ApiError};
use crate::state::SharedState;

/// GET /api/ban/whitelist
pub async fn list_whitelist(
    State(state): State<SharedState>,
) -> Result<Json<Vec<layer7waf_ip_policy::WhitelistEntry>>, ApiError> {
    let pool = state.orchestrator.store_pool();
    let entries = whitelist::list_all(&pool).await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct CreateWhitelistRequest {
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub ip_range: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    pub reason: String,
    #[serde(default)]
    pub added_by: Option<String>,
}

fn default_priority() -> i64 {
    10
}

/// POST /api/ban/whitelist - operator-curated entry. Always `manual`;
/// `admin_auto`/`system` entries are created by the pipeline itself.
pub async fn create_whitelist_entry(
    State(state): State<SharedState>,
    Json(req): Json<CreateWhitelistRequest>,
) -> Result<Json<layer7waf_ip_policy::WhitelistEntry>, ApiError> {
    if req.ip_address.is_none() && req.ip_range.is_none() {
        return Err(Layer7Error::validation("one of ip_address or ip_range is required").into());
    }

    let pool = state.orchestrator.store_pool();
    let entry = whitelist::create(
        &pool,
        NewWhitelistEntry {
            ip_address: req.ip_address,
            ip_range: req.ip_range,
            entry_type: WhitelistType::Manual,
            priority: req.priority,
            reason: req.reason,
            added_by: req.added_by,
        },
    )
    .await?;

    reload_whitelist(&state, &pool).await?;
    Ok(Json(entry))
}

/// DELETE /api/ban/whitelist/{id}
pub async fn delete_whitelist_entry(State(state): State<SharedState>, Path(id): Path<i64>) -> Result<Json<Value>, ApiError> {
    let pool = state.orchestrator.store_pool();
    match whitelist::delete(&pool, id).await? {
        Outcome::Ok(()) => {
            reload_whitelist(&state, &pool).await?;
            Ok(Json(json!({ "deleted": true })))
        }
        Outcome::Refused(r) => Err(refusal_response(&r)),
    }
}

/// Pushes the just-written whitelist table into the shared, hot-reloadable
/// snapshot every reader (the ban orchestrator, the detection engine)
/// consults, the same way `update_notification_settings` hot-swaps the
/// dispatcher's config — without this, an admin API write never takes
/// effect until the daemon restarts.
async fn reload_whitelist(state: &SharedState, pool: &sqlx::SqlitePool) -> Result<(), ApiError> {
    let entries = whitelist::list_all(pool).await?;
    state.orchestrator.whitelist().reload(entries);
    Ok(())
}
