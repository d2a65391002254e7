use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use layer7waf_notifications::{DispatcherConfig, Notification};

use crate::state::SharedState;

/// GET /api/settings/notifications
pub async fn get_notification_settings(State(state): State<SharedState>) -> Json<DispatcherConfig> {
    Json((*state.dispatcher.config()).clone())
}

/// PUT /api/settings/notifications - hot-swaps the dispatcher's live
/// config; takes effect on the next dispatch and the next background
/// scheduler tick.
pub async fn update_notification_settings(
    State(state): State<SharedState>,
    Json(config): Json<DispatcherConfig>,
) -> Json<DispatcherConfig> {
    state.dispatcher.update_config(config.clone());
    Json(config)
}

#[derive(Debug, Deserialize)]
pub struct TestNotificationRequest {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_body")]
    pub body: String,
}

fn default_title() -> String {
    "Test notification".to_string()
}

fn default_body() -> String {
    "This is a test notification triggered from the admin API.".to_string()
}

/// POST /api/notifications/test
pub async fn send_test_notification(
    State(state): State<SharedState>,
    Json(req): Json<TestNotificationRequest>,
) -> Json<Value> {
    state
        .dispatcher
        .dispatch(
            Notification {
                event_type: "test".to_string(),
                title: req.title,
                body: req.body,
                severity: "info".to_string(),
                cooldown: None,
            },
            Utc::now(),
        )
        .await;

    Json(json!({ "sent": true }))
}
