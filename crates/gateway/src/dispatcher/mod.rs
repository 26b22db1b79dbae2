//! Integration Dispatcher — consumes `response.ready`, claims each
//! event exactly once across replicas, fans the response out to the
//! user's enabled integrations, and retries failed deliveries from a
//! persistent queue.

pub mod handlers;

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use selfserve_domain::{
    AgentResponse, Config, EffectiveConfig, DeliveryOutcome, Error, EventEnvelope, EventType,
    NormalizedRequest, Result,
};
use selfserve_store::{PendingDelivery, Store};
use selfserve_transport::BuiltTransport;

use handlers::{DeliveryPayload, HandlerSet};

#[derive(Clone)]
pub struct DispatcherState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub handlers: Arc<HandlerSet>,
    /// Stable replica identity for atomic event claims.
    pub instance_id: Arc<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event intake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Unwrap a `response.ready` envelope, claim it, and run the fan-out.
/// Duplicate deliveries (broker redelivery, scaled-out replicas) lose
/// the claim and skip.
pub async fn handle_envelope(state: DispatcherState, envelope: EventEnvelope) {
    let response: AgentResponse = match envelope.payload() {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "malformed response.ready payload, dropping");
            return;
        }
    };

    match state.store.claim_event(&envelope.id, &state.instance_id) {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(event_id = %envelope.id, "event already claimed, skipping");
            return;
        }
        Err(e) => {
            tracing::error!(event_id = %envelope.id, error = %e, "event claim failed");
            return;
        }
    }

    if let Err(e) = dispatch_response(&state, &response).await {
        tracing::error!(request_id = %response.request_id, error = %e, "fan-out failed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fan-out
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve the user's enabled integrations and dispatch to each in
/// parallel. Delivery failures never propagate to the request path;
/// they are logged, retried, and visible on the delivery-status
/// endpoint.
pub async fn dispatch_response(state: &DispatcherState, response: &AgentResponse) -> Result<()> {
    let session = state
        .store
        .get_session(response.session_id)?
        .ok_or_else(|| Error::Store(format!("session {} not found", response.session_id)))?;

    // A forced integration on the original request narrows the fan-out
    // to that single kind.
    let forced = state
        .store
        .get_log(response.request_id)?
        .and_then(|log| serde_json::from_value::<NormalizedRequest>(log.request).ok())
        .and_then(|request| request.forced_integration);

    let subject = response
        .metadata
        .get("subject")
        .and_then(|v| v.as_str())
        .unwrap_or("Self-service assistant response")
        .to_owned();

    let payload = DeliveryPayload {
        request_id: response.request_id,
        session_id: response.session_id,
        user_id: session.user_id.clone(),
        agent_id: response.agent_id.clone(),
        subject,
        body: response.content.clone(),
        metadata: response.metadata.clone(),
        handles: session.handles.clone(),
    };

    let targets: Vec<EffectiveConfig> = state
        .store
        .effective_configs_for_user(&session.user_id)?
        .into_iter()
        .filter(|config| config.enabled)
        .filter(|config| forced.map_or(true, |kind| config.kind == kind))
        .collect();

    if targets.is_empty() {
        tracing::info!(
            request_id = %response.request_id,
            user_id = %session.user_id,
            "no enabled integrations for user"
        );
        return Ok(());
    }

    let mut tasks = tokio::task::JoinSet::new();
    for target in targets {
        let state = state.clone();
        let payload = payload.clone();
        tasks.spawn(async move {
            attempt_delivery(&state, &target, &payload).await;
        });
    }
    while tasks.join_next().await.is_some() {}

    Ok(())
}

/// One delivery attempt: open the log row, call the handler, close
/// the row, and schedule a redelivery when a retryable failure still
/// has budget.
pub async fn attempt_delivery(
    state: &DispatcherState,
    config: &EffectiveConfig,
    payload: &DeliveryPayload,
) {
    let attempt = match state
        .store
        .begin_delivery(payload.request_id, &payload.user_id, config.kind)
    {
        Ok(attempt) => attempt,
        Err(e) => {
            tracing::error!(request_id = %payload.request_id, error = %e, "begin_delivery failed");
            return;
        }
    };

    match state.handlers.deliver(config, payload, attempt).await {
        Ok(()) => {
            if let Err(e) = state.store.finish_delivery(
                payload.request_id,
                config.kind,
                attempt,
                DeliveryOutcome::Success,
                None,
            ) {
                tracing::error!(request_id = %payload.request_id, error = %e, "finish_delivery failed");
            }
            tracing::info!(
                request_id = %payload.request_id,
                kind = %config.kind,
                attempt,
                "delivery succeeded"
            );
        }
        Err(failure) => {
            if let Err(e) = state.store.finish_delivery(
                payload.request_id,
                config.kind,
                attempt,
                DeliveryOutcome::Failed,
                Some(&failure.message),
            ) {
                tracing::error!(request_id = %payload.request_id, error = %e, "finish_delivery failed");
            }

            if failure.retryable && attempt <= config.retry_count {
                let delay = config.backoff.delay_secs(config.retry_delay_seconds, attempt);
                let pending = PendingDelivery {
                    request_id: payload.request_id,
                    kind: config.kind,
                    user_id: payload.user_id.clone(),
                    payload: serde_json::to_value(payload).unwrap_or_default(),
                    attempt: attempt + 1,
                    next_attempt_at: Utc::now() + chrono::Duration::seconds(delay as i64),
                };
                match state.store.schedule_redelivery(&pending) {
                    Ok(()) => tracing::warn!(
                        request_id = %payload.request_id,
                        kind = %config.kind,
                        attempt,
                        delay_secs = delay,
                        error = %failure,
                        "delivery failed, retry scheduled"
                    ),
                    Err(e) => tracing::error!(
                        request_id = %payload.request_id,
                        error = %e,
                        "failed to schedule redelivery"
                    ),
                }
            } else {
                tracing::warn!(
                    request_id = %payload.request_id,
                    kind = %config.kind,
                    attempt,
                    retryable = failure.retryable,
                    error = %failure,
                    "delivery abandoned"
                );
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tick loop over the persistent retry queue. Each due row is claimed
/// (deleted) transactionally, so scaled-out dispatchers never double-
/// deliver a scheduled attempt.
pub fn start_retry_runner(state: DispatcherState, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            state.config.dispatcher.retry_tick_secs,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let due = match state.store.claim_due_redeliveries(100) {
                Ok(due) => due,
                Err(e) => {
                    tracing::error!(error = %e, "retry queue scan failed");
                    continue;
                }
            };

            for pending in due {
                // Config may have changed since the failure; resolve
                // it fresh for every attempt.
                let config = match state
                    .store
                    .get_user_effective_config(&pending.user_id, pending.kind)
                {
                    Ok(config) if config.enabled => config,
                    Ok(_) => {
                        tracing::info!(
                            request_id = %pending.request_id,
                            kind = %pending.kind,
                            "integration disabled since failure, dropping retry"
                        );
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "effective config lookup failed");
                        continue;
                    }
                };

                let payload: DeliveryPayload = match serde_json::from_value(pending.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(
                            request_id = %pending.request_id,
                            error = %e,
                            "corrupt redelivery payload, dropping"
                        );
                        continue;
                    }
                };

                let state = state.clone();
                tokio::spawn(async move {
                    attempt_delivery(&state, &config, &payload).await;
                });
            }
        }
        tracing::debug!("retry runner shutting down");
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service wiring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Direct-HTTP ingress: the worker POSTs `response.ready` envelopes
/// here. Accepts immediately; the fan-out runs detached so a slow
/// delivery target never backs up the worker.
async fn dispatch_http(
    State(state): State<DispatcherState>,
    Json(envelope): Json<EventEnvelope>,
) -> Response {
    tokio::spawn(handle_envelope(state, envelope));
    Json(serde_json::json!({ "accepted": true })).into_response()
}

async fn dispatcher_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

pub fn http_app(state: DispatcherState) -> Router {
    Router::new()
        .route("/internal/v1/dispatch", post(dispatch_http))
        .route("/health", get(dispatcher_health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Attach the broker consumer when running on the broker strategy.
pub fn start_consumers(
    state: &DispatcherState,
    built: &BuiltTransport,
    shutdown: CancellationToken,
) {
    if let BuiltTransport::Broker(broker) = built {
        let state = state.clone();
        broker.spawn_subscriber(
            EventType::ResponseReady,
            "selfserve-dispatcher",
            state.config.dispatcher.max_in_flight,
            shutdown,
            move |envelope| {
                let state = state.clone();
                async move { handle_envelope(state, envelope).await }
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selfserve_domain::{BackoffShape, IntegrationKind, SurfaceHandles, SurfaceKind};
    use uuid::Uuid;

    fn dispatcher_state() -> DispatcherState {
        let defaults = vec![selfserve_domain::IntegrationDefault {
            kind: IntegrationKind::Test,
            enabled: true,
            config: serde_json::json!({}),
            priority: 0,
            retry_count: 0,
            retry_delay_seconds: 0,
            backoff: BackoffShape::Linear,
        }];
        let config = Arc::new(Config::default());
        DispatcherState {
            handlers: Arc::new(HandlerSet::from_config(&config).unwrap()),
            config,
            store: Arc::new(Store::open_in_memory(defaults).unwrap()),
            instance_id: Arc::new("dispatcher-test".into()),
        }
    }

    fn seeded_response(state: &DispatcherState) -> AgentResponse {
        let (session, _) = state
            .store
            .get_or_create_session(
                "bob",
                SurfaceKind::Web,
                &SurfaceHandles::default(),
                chrono::Duration::minutes(30),
            )
            .unwrap();
        let request = NormalizedRequest::new("bob", SurfaceKind::Web, "hello");
        state.store.append_log(session.id, &request).unwrap();
        AgentResponse {
            request_id: request.request_id,
            session_id: session.id,
            agent_id: Some("default".into()),
            content: "done".into(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn fan_out_writes_delivery_log() {
        let state = dispatcher_state();
        let response = seeded_response(&state);

        dispatch_response(&state, &response).await.unwrap();

        let logs = state.store.list_deliveries(response.request_id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, IntegrationKind::Test);
        assert_eq!(logs[0].outcome, DeliveryOutcome::Success);
        assert_eq!(logs[0].attempt, 1);
    }

    #[tokio::test]
    async fn duplicate_event_is_claimed_once() {
        let state = dispatcher_state();
        let response = seeded_response(&state);
        let envelope = EventEnvelope::new(
            "selfserve.worker",
            "selfserve.response.ready",
            &response.session_id.to_string(),
            &response,
        )
        .unwrap();

        handle_envelope(state.clone(), envelope.clone()).await;
        handle_envelope(state.clone(), envelope).await;

        // One claimed processing run, so exactly one attempt row.
        let logs = state.store.list_deliveries(response.request_id).unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn forced_integration_narrows_fanout() {
        let state = dispatcher_state();
        // Also enable webhook for bob so there are two candidates.
        state
            .store
            .upsert_user_config(&selfserve_domain::UserIntegrationConfig {
                user_id: "bob".into(),
                kind: IntegrationKind::Webhook,
                enabled: true,
                config: serde_json::json!({"url": "http://127.0.0.1:1/unreachable"}),
                priority: 10,
                retry_count: 0,
                retry_delay_seconds: 1,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .unwrap();

        let (session, _) = state
            .store
            .get_or_create_session(
                "bob",
                SurfaceKind::Web,
                &SurfaceHandles::default(),
                chrono::Duration::minutes(30),
            )
            .unwrap();
        let mut request = NormalizedRequest::new("bob", SurfaceKind::Web, "hello");
        request.forced_integration = Some(IntegrationKind::Test);
        state.store.append_log(session.id, &request).unwrap();

        let response = AgentResponse {
            request_id: request.request_id,
            session_id: session.id,
            agent_id: None,
            content: "done".into(),
            metadata: serde_json::json!({}),
        };
        dispatch_response(&state, &response).await.unwrap();

        let logs = state.store.list_deliveries(response.request_id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, IntegrationKind::Test);
    }

    #[tokio::test]
    async fn retryable_failure_schedules_redelivery() {
        let state = dispatcher_state();
        let response = seeded_response(&state);

        // Webhook to a closed port: connection refused, retryable.
        let config = EffectiveConfig {
            kind: IntegrationKind::Webhook,
            enabled: true,
            config: serde_json::json!({"url": "http://127.0.0.1:1/hook", "timeout_secs": 1}),
            priority: 0,
            retry_count: 2,
            retry_delay_seconds: 1,
            backoff: BackoffShape::Linear,
            source: selfserve_domain::ConfigSource::User,
        };
        let payload = DeliveryPayload {
            request_id: response.request_id,
            session_id: response.session_id,
            user_id: "bob".into(),
            agent_id: None,
            subject: "s".into(),
            body: "b".into(),
            metadata: serde_json::json!({}),
            handles: SurfaceHandles::default(),
        };

        attempt_delivery(&state, &config, &payload).await;

        let logs = state.store.list_deliveries(response.request_id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, DeliveryOutcome::Failed);

        // The redelivery row exists but is not due for ~1s.
        let due_later = state.store.claim_due_redeliveries(10);
        assert!(due_later.unwrap().is_empty());
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let due = state.store.claim_due_redeliveries(10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt, 2);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let state = dispatcher_state();
        let response = seeded_response(&state);

        // No url in the bag: terminal configuration failure.
        let config = EffectiveConfig {
            kind: IntegrationKind::Webhook,
            enabled: true,
            config: serde_json::json!({}),
            priority: 0,
            retry_count: 5,
            retry_delay_seconds: 1,
            backoff: BackoffShape::Linear,
            source: selfserve_domain::ConfigSource::User,
        };
        let payload = DeliveryPayload {
            request_id: response.request_id,
            session_id: response.session_id,
            user_id: "bob".into(),
            agent_id: None,
            subject: "s".into(),
            body: "b".into(),
            metadata: serde_json::json!({}),
            handles: SurfaceHandles::default(),
        };

        attempt_delivery(&state, &config, &payload).await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(state.store.claim_due_redeliveries(10).unwrap().is_empty());
    }
}
