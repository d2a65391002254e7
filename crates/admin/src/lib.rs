pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::state::SharedState;

pub use state::{AppState, SharedState as SharedStateType, WafMetrics};

/// Build the Axum router with all admin API routes and middleware.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health and metrics
        .route("/api/health", get(routes::health::health_check))
        .route("/api/metrics", get(routes::metrics::get_metrics))
        // Bans
        .route("/api/ban/bans", get(routes::bans::list_bans).post(routes::bans::create_ban))
        .route("/api/ban/bans/stats", get(routes::bans::ban_stats))
        .route("/api/ban/bans/sync", post(routes::bans::sync_all))
        .route("/api/ban/bans/sync-status", get(routes::bans::sync_status))
        .route("/api/ban/bans/sync/{ip}", post(routes::bans::sync_one))
        .route("/api/ban/bans/{id}", axum::routing::delete(routes::bans::delete_ban))
        .route("/api/ban/bans/{id}/permanent", post(routes::bans::make_permanent))
        // Whitelist
        .route(
            "/api/ban/whitelist",
            get(routes::whitelist::list_whitelist).post(routes::whitelist::create_whitelist_entry),
        )
        .route(
            "/api/ban/whitelist/{id}",
            axum::routing::delete(routes::whitelist::delete_whitelist_entry),
        )
        // Notification settings
        .route(
            "/api/settings/notifications",
            get(routes::settings::get_notification_settings).put(routes::settings::update_notification_settings),
        )
        .route("/api/notifications/test", post(routes::settings::send_test_notification))
        // Live event stream
        .route("/api/events", get(routes::events::event_stream))
        // Attach shared state and middleware
        .with_state(state)
        .layer(cors)
}

/// Start the admin API server on the specified address.
///
/// This function will block until the server is shut down.
pub async fn run_admin_server(state: SharedState, listen_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("admin API server listening on {}", listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
