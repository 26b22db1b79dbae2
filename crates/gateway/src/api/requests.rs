//! Synchronous inbound surfaces (web, cli, generic) and the
//! acknowledge-then-work tool surface.
//!
//! Every handler walks the same per-turn pipeline: authenticate →
//! normalize → sessionize (turn lock) → dispatch → await/ack. The
//! chat surface shares the pipeline from its own module.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use selfserve_domain::{
    AgentResponse, Error, IntegrationKind, NormalizedRequest, Result, Session, SurfaceKind,
};
use selfserve_store::TurnToken;

use crate::api::{api_error, auth::Principal};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request bodies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct WebRequestBody {
    /// Cross-checked against the authenticated subject when present.
    #[serde(default)]
    pub user_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Force delivery to a single integration kind.
    #[serde(default)]
    pub integration: Option<IntegrationKind>,
}

#[derive(Debug, Deserialize)]
pub struct ToolRequestBody {
    #[serde(default)]
    pub user_id: Option<String>,
    pub content: String,
    pub tool_id: String,
    #[serde(default)]
    pub tool_instance_id: Option<String>,
    pub trigger_event: String,
    #[serde(default)]
    pub tool_context: Option<serde_json::Value>,
    #[serde(default)]
    pub integration: Option<IntegrationKind>,
}

#[derive(Debug, Deserialize)]
pub struct GenericRequestBody {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub integration: Option<IntegrationKind>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub(crate) struct TurnOutcome {
    pub session_id: Uuid,
    pub request_id: Uuid,
    pub response: AgentResponse,
}

/// Resolve (or create) the session for a normalized request and take
/// its turn lock. A second in-flight turn surfaces `conflict` here.
pub(crate) fn sessionize(
    state: &AppState,
    request: &NormalizedRequest,
) -> Result<(Session, TurnToken)> {
    let idle = chrono::Duration::minutes(state.config.sessions.idle_ttl_minutes as i64);
    let (session, _created) =
        state
            .store
            .get_or_create_session(&request.user_id, request.surface, &request.handles, idle)?;
    let token = state.store.acquire_turn(session.id)?;
    Ok((session, token))
}

/// Persist the log row and put `request.created` on the substrate.
pub(crate) async fn begin_dispatch(
    state: &AppState,
    request: &NormalizedRequest,
    session_id: Uuid,
) -> Result<()> {
    state.store.append_log(session_id, request)?;
    let ack = state.transport.send_request(request, session_id).await?;
    if let (Some(event_id), Some(event_type)) = (ack.event_id, ack.event_type) {
        state
            .store
            .set_log_event(request.request_id, &event_id, &event_type)?;
    }
    Ok(())
}

/// Await `response.ready` within the configured deadline, marking the
/// log on timeout. The response event, if it arrives later, is still
/// persisted by the worker and delivered by the dispatcher.
pub(crate) async fn await_marking(state: &AppState, request_id: Uuid) -> Result<AgentResponse> {
    let timeout = std::time::Duration::from_secs(state.config.router.response_timeout_secs);
    match state.transport.await_response(request_id, timeout).await {
        Ok(response) => Ok(response),
        Err(err @ Error::Timeout(_)) => {
            state.store.fail_log(request_id, "timeout")?;
            Err(err)
        }
        Err(err) => {
            state.store.fail_log(request_id, "transport")?;
            Err(err)
        }
    }
}

/// Full synchronous turn: validate, sessionize, dispatch, await.
/// The turn lock is released on every path.
pub(crate) async fn run_sync_turn(
    state: &AppState,
    request: NormalizedRequest,
) -> Result<TurnOutcome> {
    request.validate(state.config.max_content_bytes())?;
    let (session, token) = sessionize(state, &request)?;

    let result = async {
        begin_dispatch(state, &request, session.id).await?;
        await_marking(state, request.request_id).await
    }
    .await;

    release_quietly(state, &token);

    let response = result?;
    if response.is_error() {
        return Err(Error::Unavailable(response.content));
    }

    Ok(TurnOutcome {
        session_id: session.id,
        request_id: request.request_id,
        response,
    })
}

pub(crate) fn release_quietly(state: &AppState, token: &TurnToken) {
    if let Err(e) = state.store.release_turn(token) {
        tracing::warn!(session_id = %token.session_id, error = %e, "turn release failed");
    }
}

fn sync_response(outcome: TurnOutcome) -> Response {
    Json(serde_json::json!({
        "session_id": outcome.session_id,
        "request_id": outcome.request_id,
        "agent_id": outcome.response.agent_id,
        "content": outcome.response.content,
    }))
    .into_response()
}

/// The body may carry a `user_id`; it must equal the authenticated
/// subject, otherwise the request is rejected outright.
fn check_subject(principal: &Principal, presented: Option<&str>) -> Result<()> {
    match presented {
        Some(user_id) if user_id != principal.subject => Err(Error::Unauthorized),
        _ => Ok(()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/v1/requests/web and /cli
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn web(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WebRequestBody>,
) -> Response {
    browser_surface(state, headers, body, SurfaceKind::Web).await
}

pub async fn cli(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WebRequestBody>,
) -> Response {
    browser_surface(state, headers, body, SurfaceKind::Cli).await
}

async fn browser_surface(
    state: AppState,
    headers: HeaderMap,
    body: WebRequestBody,
    surface: SurfaceKind,
) -> Response {
    let principal = match state.resolver.resolve_web(&headers).await {
        Ok(principal) => principal,
        Err(err) => return api_error(err),
    };
    if let Err(err) = check_subject(&principal, body.user_id.as_deref()) {
        return api_error(err);
    }

    let mut request = NormalizedRequest::new(&principal.subject, surface, body.content);
    request.forced_integration = body.integration;
    request.integration_context = serde_json::json!({
        "client_ip": body.client_ip,
        "user_agent": body.user_agent,
    });

    detached_sync_turn(state, request).await
}

/// Run a synchronous turn on a detached task. If the client
/// disconnects, axum drops the handler future, but the turn keeps
/// running to its deadline — the lock is released, the timeout is
/// recorded, and a late response still flows to the dispatcher.
async fn detached_sync_turn(state: AppState, request: NormalizedRequest) -> Response {
    let handle = tokio::spawn(async move { run_sync_turn(&state, request).await });
    match handle.await {
        Ok(Ok(outcome)) => sync_response(outcome),
        Ok(Err(err)) => api_error(err),
        Err(join_err) => api_error(Error::Internal(format!("turn task failed: {join_err}"))),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/v1/requests/tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool triggers acknowledge with `202` once the event is on the
/// substrate; the response reaches the principal's configured
/// integrations asynchronously.
pub async fn tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ToolRequestBody>,
) -> Response {
    let principal = match state.resolver.resolve_tool(&headers) {
        Ok(principal) => principal,
        Err(err) => return api_error(err),
    };
    if let Err(err) = check_subject(&principal, body.user_id.as_deref()) {
        return api_error(err);
    }

    let mut request = NormalizedRequest::new(&principal.subject, SurfaceKind::Tool, body.content);
    request.forced_integration = body.integration;
    request.integration_context = serde_json::json!({
        "tool_id": body.tool_id,
        "tool_instance_id": body.tool_instance_id,
        "trigger_event": body.trigger_event,
        "tool_context": body.tool_context,
    });

    if let Err(err) = request.validate(state.config.max_content_bytes()) {
        return api_error(err);
    }

    let (session, token) = match sessionize(&state, &request) {
        Ok(pair) => pair,
        Err(err) => return api_error(err),
    };

    if let Err(err) = begin_dispatch(&state, &request, session.id).await {
        release_quietly(&state, &token);
        return api_error(err);
    }

    let request_id = request.request_id;
    let session_id = session.id;
    let state_bg = state.clone();
    tokio::spawn(async move {
        if let Err(e) = await_marking(&state_bg, request_id).await {
            tracing::warn!(request_id = %request_id, error = %e, "tool turn did not complete in time");
        }
        release_quietly(&state_bg, &token);
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "request_id": request_id,
            "session_id": session_id,
            "status": "accepted",
        })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/v1/requests/generic (feature-flagged, default off)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn generic(
    State(state): State<AppState>,
    Json(body): Json<GenericRequestBody>,
) -> Response {
    if !state.config.router.generic_enabled {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "not_found" })),
        )
            .into_response();
    }

    let mut request = NormalizedRequest::new(&body.user_id, SurfaceKind::Generic, body.content);
    request.forced_integration = body.integration;

    detached_sync_turn(state, request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use selfserve_domain::{Config, ContextUpdate, ProcessingNotice, TransportStrategy};
    use selfserve_store::Store;
    use selfserve_transport::{DispatchAck, Transport};

    use crate::api::auth::{CredentialResolver, PrincipalScope};
    use crate::api::chat::DedupeStore;
    use crate::turn_queue::TurnQueueMap;

    fn principal(subject: &str) -> Principal {
        Principal {
            subject: subject.into(),
            scope: PrincipalScope::WebUser,
        }
    }

    /// Echoes each dispatched request straight back as a response,
    /// like a worker that answers instantly.
    #[derive(Default)]
    struct EchoTransport {
        canned: Mutex<std::collections::HashMap<Uuid, AgentResponse>>,
        fail_await: bool,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send_request(
            &self,
            request: &NormalizedRequest,
            session_id: Uuid,
        ) -> Result<DispatchAck> {
            self.canned.lock().insert(
                request.request_id,
                AgentResponse {
                    request_id: request.request_id,
                    session_id,
                    agent_id: Some("default".into()),
                    content: format!("echo: {}", request.content),
                    metadata: serde_json::json!({}),
                },
            );
            Ok(DispatchAck::default())
        }

        async fn await_response(
            &self,
            request_id: Uuid,
            _timeout: std::time::Duration,
        ) -> Result<AgentResponse> {
            if self.fail_await {
                return Err(Error::Timeout("no response".into()));
            }
            self.canned
                .lock()
                .remove(&request_id)
                .ok_or_else(|| Error::Timeout("no response".into()))
        }

        async fn publish_processing(
            &self,
            _notice: &ProcessingNotice,
            _session_id: Uuid,
        ) -> Result<()> {
            Ok(())
        }

        async fn publish_response(&self, _response: &AgentResponse) -> Result<()> {
            Ok(())
        }

        async fn publish_context_update(&self, _update: &ContextUpdate) -> Result<()> {
            Ok(())
        }

        fn strategy(&self) -> TransportStrategy {
            TransportStrategy::DirectHttp
        }
    }

    fn app_state(fail_await: bool) -> AppState {
        let mut config = Config::default();
        config.auth.api_keys.keys.push(selfserve_domain::config::ApiKeyEntry {
            key: "KEY_ALICE".into(),
            principal: "alice".into(),
            scope: selfserve_domain::config::ApiKeyScope::Web,
        });
        let config = Arc::new(config);
        AppState {
            resolver: Arc::new(CredentialResolver::from_config(&config.auth)),
            config,
            store: Arc::new(Store::open_in_memory(Vec::new()).unwrap()),
            transport: Arc::new(EchoTransport {
                fail_await,
                ..EchoTransport::default()
            }),
            dedupe: Arc::new(DedupeStore::new(std::time::Duration::from_secs(60))),
            turn_queues: Arc::new(TurnQueueMap::new()),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn web_happy_path_returns_session_and_content() {
        let state = app_state(false);
        let response = web(
            State(state.clone()),
            bearer("KEY_ALICE"),
            Json(WebRequestBody {
                user_id: Some("alice".into()),
                content: "hello".into(),
                client_ip: None,
                user_agent: None,
                integration: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        // The turn lock was released: a second turn works.
        let response = web(
            State(state),
            bearer("KEY_ALICE"),
            Json(WebRequestBody {
                user_id: None,
                content: "again".into(),
                client_ip: None,
                user_agent: None,
                integration: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_bearer_creates_no_log_rows() {
        let state = app_state(false);
        let response = web(
            State(state.clone()),
            bearer("WRONG"),
            Json(WebRequestBody {
                user_id: Some("alice".into()),
                content: "hello".into(),
                client_ip: None,
                user_agent: None,
                integration: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // No session was created for anyone.
        let idle = chrono::Duration::minutes(30);
        let (_, created) = state
            .store
            .get_or_create_session("alice", SurfaceKind::Web, &Default::default(), idle)
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn concurrent_turn_is_conflict() {
        let state = app_state(false);
        // First request establishes the session, then we hold its lock
        // the way an in-flight turn would.
        let request = NormalizedRequest::new("alice", SurfaceKind::Web, "warmup");
        let (session, _token) = sessionize(&state, &request).unwrap();
        // _token held: a new turn on the same session conflicts.
        let err = state.store.acquire_turn(session.id).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let response = web(
            State(state),
            bearer("KEY_ALICE"),
            Json(WebRequestBody {
                user_id: Some("alice".into()),
                content: "second".into(),
                client_ip: None,
                user_agent: None,
                integration: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn timeout_marks_log_failed_and_returns_504() {
        let state = app_state(true);
        let request = NormalizedRequest::new("alice", SurfaceKind::Web, "slow one");
        let request_id = request.request_id;

        let err = run_sync_turn(&state, request).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(err.status_code(), 504);

        let log = state.store.get_log(request_id).unwrap().unwrap();
        assert_eq!(log.status, selfserve_domain::RequestStatus::Failed);

        // A late completion still lands (asynchronous delivery path).
        state
            .store
            .complete_log(request_id, &serde_json::json!({"content": "late"}), None, 1)
            .unwrap();
        let log = state.store.get_log(request_id).unwrap().unwrap();
        assert_eq!(log.status, selfserve_domain::RequestStatus::Completed);
    }

    #[tokio::test]
    async fn generic_surface_is_dark_by_default() {
        let state = app_state(false);
        let response = generic(
            State(state),
            Json(GenericRequestBody {
                user_id: "nobody".into(),
                content: "hi".into(),
                integration: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_content_is_bad_request() {
        let state = app_state(false);
        let max = state.config.max_content_bytes();
        let response = web(
            State(state),
            bearer("KEY_ALICE"),
            Json(WebRequestBody {
                user_id: None,
                content: "x".repeat(max + 1),
                client_ip: None,
                user_agent: None,
                integration: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn subject_check_accepts_match_and_absence() {
        assert!(check_subject(&principal("alice"), Some("alice")).is_ok());
        assert!(check_subject(&principal("alice"), None).is_ok());
    }

    #[test]
    fn subject_check_rejects_mismatch() {
        let err = check_subject(&principal("alice"), Some("bob")).unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
    }

    #[test]
    fn tool_body_requires_trigger_event() {
        let parsed: std::result::Result<ToolRequestBody, _> = serde_json::from_str(
            r#"{"user_id":"svc-snow","content":"laptop refresh","tool_id":"snow"}"#,
        );
        assert!(parsed.is_err());

        let parsed: std::result::Result<ToolRequestBody, _> = serde_json::from_str(
            r#"{"user_id":"svc-snow","content":"laptop refresh","tool_id":"snow",
                "trigger_event":"asset.refresh.due"}"#,
        );
        assert!(parsed.is_ok());
    }
}
