//! Health probes. Public, unauthenticated; the detailed probe reports
//! component reachability without secrets or per-user data.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use selfserve_domain::TransportStrategy;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /health/detailed
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health_detailed(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.ping().is_ok();
    let strategy = match state.transport.strategy() {
        TransportStrategy::Broker => "broker",
        TransportStrategy::DirectHttp => "direct_http",
    };

    let status = if store_ok { "healthy" } else { "degraded" };
    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "components": {
                "store": if store_ok { "ok" } else { "unreachable" },
                "transport": { "strategy": strategy },
                "runtime": { "configured": !state.config.runtime.base_url.is_empty() },
            },
        })),
    )
}
