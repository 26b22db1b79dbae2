//! Agent Worker — consumes `request.created`, drives the agent
//! runtime, and produces `response.ready`.
//!
//! Idempotency against at-least-once delivery: a claim marker on the
//! request log. Completed logs short-circuit with the stored response;
//! an in-flight claim drops the duplicate. A runtime failure still
//! produces `response.ready` (error kind) — never a silent drop.

pub mod runtime;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use selfserve_domain::{
    AgentResponse, Config, ContextUpdate, Error, EventEnvelope, EventType, NormalizedRequest,
    ProcessingNotice, Result,
};
use selfserve_store::{DispatchClaim, Store};
use selfserve_transport::{BuiltTransport, Transport};

use runtime::AgentRuntime;

#[derive(Clone)]
pub struct WorkerState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub transport: Arc<dyn Transport>,
    pub runtime: Arc<dyn AgentRuntime>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core processing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process one normalized request. Returns `None` for duplicates that
/// are already being processed elsewhere.
pub async fn process_request(
    state: &WorkerState,
    request: &NormalizedRequest,
    session_id: Uuid,
) -> Option<AgentResponse> {
    match state.store.claim_dispatch(request.request_id) {
        Ok(DispatchClaim::Claimed) => {}
        Ok(DispatchClaim::AlreadyCompleted(log)) => {
            tracing::info!(request_id = %request.request_id, "duplicate delivery, returning stored response");
            return log
                .response
                .and_then(|raw| serde_json::from_value::<AgentResponse>(raw).ok());
        }
        Ok(DispatchClaim::InFlight) => {
            tracing::debug!(request_id = %request.request_id, "duplicate delivery while in flight, dropping");
            return None;
        }
        Err(e) => {
            tracing::error!(request_id = %request.request_id, error = %e, "dispatch claim failed");
            return None;
        }
    }

    let started = Instant::now();
    let result = run_agent(state, request, session_id).await;
    let processing_ms = started.elapsed().as_millis() as i64;

    match result {
        Ok(response) => {
            let stored = serde_json::to_value(&response).unwrap_or_default();
            if let Err(e) = state.store.complete_log(
                request.request_id,
                &stored,
                response.agent_id.as_deref(),
                processing_ms,
            ) {
                tracing::error!(request_id = %request.request_id, error = %e, "complete_log failed");
            }
            Some(response)
        }
        Err(e) => {
            // The deadline or a runtime failure still yields a
            // response.ready so the router and dispatcher can react.
            tracing::warn!(request_id = %request.request_id, error = %e, "agent invocation failed");
            if let Err(err) = state.store.fail_log(request.request_id, &e.to_string()) {
                tracing::error!(request_id = %request.request_id, error = %err, "fail_log failed");
            }
            Some(AgentResponse {
                request_id: request.request_id,
                session_id,
                agent_id: None,
                content: match e {
                    Error::Timeout(_) => "the assistant timed out handling this request".into(),
                    _ => "the assistant could not handle this request".into(),
                },
                metadata: serde_json::json!({ "kind": "error", "error": e.public_label() }),
            })
        }
    }
}

/// Drive the runtime: session handle, invocation, routing directives,
/// context updates.
async fn run_agent(
    state: &WorkerState,
    request: &NormalizedRequest,
    session_id: Uuid,
) -> Result<AgentResponse> {
    let session = state
        .store
        .get_session(session_id)?
        .ok_or_else(|| Error::Store(format!("session {session_id} not found")))?;

    let handle = match session.runtime_handle {
        Some(handle) => handle,
        None => {
            let handle = state.runtime.open_session(session.id, &session.user_id).await?;
            state.store.set_runtime_handle(session.id, &handle)?;
            handle
        }
    };

    let mut agent_id = session
        .current_agent_id
        .unwrap_or_else(|| state.config.runtime.default_agent_id.clone());

    let notice = ProcessingNotice {
        request_id: request.request_id,
        agent_id: Some(agent_id.clone()),
    };
    if let Err(e) = state.transport.publish_processing(&notice, session_id).await {
        tracing::warn!(request_id = %request.request_id, error = %e, "request.processing publish failed");
    }

    // Routing loop: a directive hands the session to a specialized
    // agent and re-dispatches internally, bounded by the hop limit.
    let context = session.context.clone();
    let mut hops = 0u32;
    let reply = loop {
        let reply = state
            .runtime
            .invoke(&handle, &agent_id, &request.content, &context)
            .await?;

        match reply.routing_directive {
            Some(ref directive) if hops < state.config.worker.routing_hop_limit => {
                tracing::info!(
                    session_id = %session_id,
                    from = %agent_id,
                    to = %directive.agent_id,
                    "agent routing directive"
                );
                state.store.set_current_agent(session_id, &directive.agent_id)?;
                agent_id = directive.agent_id.clone();
                hops += 1;
                continue;
            }
            Some(_) => {
                tracing::warn!(session_id = %session_id, hops, "routing hop limit reached");
                break reply;
            }
            None => break reply,
        }
    };

    if let Some(delta) = reply.context_delta {
        let max = state.config.sessions.max_context_kb * 1024;
        state.store.update_session_context(session_id, &delta, max)?;
        let update = ContextUpdate {
            session_id,
            context_delta: delta,
        };
        if let Err(e) = state.transport.publish_context_update(&update).await {
            tracing::warn!(session_id = %session_id, error = %e, "context update publish failed");
        }
    }

    Ok(AgentResponse {
        request_id: request.request_id,
        session_id,
        agent_id: Some(agent_id),
        content: reply.content,
        metadata: reply.metadata,
    })
}

/// Unwrap a `request.created` envelope and run it through processing,
/// then publish `response.ready`.
pub async fn process_envelope(state: WorkerState, envelope: EventEnvelope) {
    let session_id: Uuid = match envelope.subject.parse() {
        Ok(id) => id,
        Err(_) => {
            tracing::warn!(subject = %envelope.subject, "envelope subject is not a session id, dropping");
            return;
        }
    };
    let request: NormalizedRequest = match envelope.payload() {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "malformed request.created payload, dropping");
            return;
        }
    };

    if let Some(response) = process_request(&state, &request, session_id).await {
        if let Err(e) = state.transport.publish_response(&response).await {
            tracing::error!(request_id = %response.request_id, error = %e, "response.ready publish failed");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service wiring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Direct-HTTP ingress: the router POSTs `request.created` envelopes
/// here and reads the response body.
async fn process_http(
    State(state): State<WorkerState>,
    Json(envelope): Json<EventEnvelope>,
) -> Response {
    let session_id: Uuid = match envelope.subject.parse() {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "bad_request" })),
            )
                .into_response()
        }
    };
    let request: NormalizedRequest = match envelope.payload() {
        Ok(request) => request,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "bad_request" })),
            )
                .into_response()
        }
    };

    match process_request(&state, &request, session_id).await {
        Some(response) => {
            // Fan the response out through the dispatcher as well —
            // identical behavior to the broker path.
            if let Err(e) = state.transport.publish_response(&response).await {
                tracing::error!(request_id = %response.request_id, error = %e, "response.ready publish failed");
            }
            Json(response).into_response()
        }
        None => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "conflict" })),
        )
            .into_response(),
    }
}

async fn worker_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

pub fn http_app(state: WorkerState) -> Router {
    Router::new()
        .route("/internal/v1/process", post(process_http))
        .route("/health", get(worker_health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Attach the broker consumer when running on the broker strategy.
pub fn start_consumers(state: &WorkerState, built: &BuiltTransport, shutdown: CancellationToken) {
    if let BuiltTransport::Broker(broker) = built {
        let state = state.clone();
        broker.spawn_subscriber(
            EventType::RequestCreated,
            "selfserve-worker",
            state.config.worker.max_in_flight,
            shutdown,
            move |envelope| {
                let state = state.clone();
                async move { process_envelope(state, envelope).await }
            },
        );
    }
}
