//! Delivery-status introspection: the attempt series for one request.
//!
//! Delivery failures are never surfaced on the request path; this is
//! where a caller checks what happened to their fan-out. Callers only
//! ever see their own requests.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use uuid::Uuid;

use selfserve_domain::Error;

use crate::api::api_error;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/v1/deliveries/:request_id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn delivery_status(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let principal = match state.resolver.resolve_web(&headers).await {
        Ok(principal) => principal,
        Err(err) => return api_error(err),
    };

    let log = match state.store.get_log(request_id) {
        Ok(Some(log)) => log,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "not_found" })),
            )
                .into_response()
        }
        Err(err) => return api_error(err),
    };

    let session = match state.store.get_session(log.session_id) {
        Ok(Some(session)) => session,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "not_found" })),
            )
                .into_response()
        }
        Err(err) => return api_error(err),
    };

    if session.user_id != principal.subject {
        return api_error(Error::Forbidden("not your request".into()));
    }

    let deliveries = match state.store.list_deliveries(request_id) {
        Ok(deliveries) => deliveries,
        Err(err) => return api_error(err),
    };

    let attempts: Vec<serde_json::Value> = deliveries
        .iter()
        .map(|d| {
            serde_json::json!({
                "kind": d.kind,
                "attempt": d.attempt,
                "outcome": d.outcome,
                "error": d.error,
                "started_at": d.started_at,
                "completed_at": d.completed_at,
            })
        })
        .collect();

    Json(serde_json::json!({
        "request_id": request_id,
        "status": log.status,
        "deliveries": attempts,
    }))
    .into_response()
}
