use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use layer7waf_common::{Layer7Error, Refusal};

/// Wraps a pipeline error or refusal so `?` works directly in route
/// handlers and each variant maps to the HTTP status an admin UI expects.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<Layer7Error> for ApiError {
    fn from(err: Layer7Error) -> Self {
        let status = match &err {
            Layer7Error::Validation(_) => StatusCode::BAD_REQUEST,
            Layer7Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Layer7Error::Config(_)
            | Layer7Error::Fatal { .. }
            | Layer7Error::Io(_)
            | Layer7Error::Serde(_)
            | Layer7Error::Database(_)
            | Layer7Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

/// Maps a structured policy refusal to the status code the admin UI uses
/// to distinguish "can't" from "won't" (spec §7 propagation policy).
pub fn refusal_response(refusal: &Refusal) -> ApiError {
    let status = match refusal {
        Refusal::Whitelisted { .. } => StatusCode::CONFLICT,
        Refusal::AlreadyBanned { .. } => StatusCode::CONFLICT,
        Refusal::NotBanned => StatusCode::NOT_FOUND,
        Refusal::SystemWhitelistEntry => StatusCode::FORBIDDEN,
    };
    ApiError(status, refusal.to_string())
}

pub fn not_found(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, message.into())
}
