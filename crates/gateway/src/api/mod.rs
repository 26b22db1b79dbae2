pub mod auth;
pub mod chat;
pub mod deliveries;
pub mod health;
pub mod requests;
pub mod signature;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use uuid::Uuid;

use selfserve_domain::Error;

use crate::state::AppState;

/// Build the router service's API.
///
/// Authentication is per-surface (signature, bearer, API key), so it
/// lives in the handlers rather than a blanket middleware layer; the
/// health probes are the only deliberately open routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/requests/chat_event", post(chat::chat_event))
        .route("/api/v1/requests/chat_interactive", post(chat::chat_interactive))
        .route("/api/v1/requests/chat_slash", post(chat::chat_slash))
        .route("/api/v1/requests/web", post(requests::web))
        .route("/api/v1/requests/cli", post(requests::cli))
        .route("/api/v1/requests/tool", post(requests::tool))
        .route("/api/v1/requests/generic", post(requests::generic))
        .route("/api/v1/deliveries/:request_id", get(deliveries::delivery_status))
        .route("/health", get(health::health))
        .route("/health/detailed", get(health::health_detailed))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Build a standardized JSON error response: `{ "error": "<label>" }`.
///
/// Only the closed taxonomy label crosses the boundary. Internal
/// causes are logged with a correlation id that is echoed to the
/// caller for support round-trips.
pub fn api_error(err: Error) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let label = err.public_label();

    let body = match label {
        "internal" => {
            let correlation_id = Uuid::new_v4();
            tracing::error!(correlation_id = %correlation_id, error = %err, "internal error");
            serde_json::json!({ "error": label, "correlation_id": correlation_id })
        }
        "bad_request" => {
            // Field-level cause is safe to surface for schema errors.
            serde_json::json!({ "error": label, "detail": err.to_string() })
        }
        "unavailable" => serde_json::json!({ "error": label, "retry_after": 5 }),
        _ => serde_json::json!({ "error": label }),
    };

    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_body_has_no_detail() {
        let resp = api_error(Error::Unauthorized);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn conflict_maps_to_409() {
        let resp = api_error(Error::Conflict("turn in flight".into()));
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn store_errors_map_to_500() {
        let resp = api_error(Error::Store("disk full".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
