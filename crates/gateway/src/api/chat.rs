//! Chat surface: signed platform callbacks (events, interactive
//! actions, slash commands).
//!
//! The platform expects an ack within 3 seconds, so these handlers
//! verify the signature, dedupe, and acknowledge immediately; the
//! actual turn runs in a background task and the response travels
//! back through the dispatcher's chat integration to the originating
//! thread.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use selfserve_domain::{NormalizedRequest, SurfaceHandles, SurfaceKind};

use crate::api::signature::verify_signature;
use crate::api::{api_error, requests};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dedupe store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory idempotency store. Tracks seen event ids with a TTL to
/// prevent duplicate turn execution from platform retries.
pub struct DedupeStore {
    seen: parking_lot::Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: parking_lot::Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `true` if this event id was already seen (duplicate).
    pub fn check_and_insert(&self, event_id: &str) -> bool {
        let mut map = self.seen.lock();
        let now = Instant::now();

        // Lazy cleanup when the map grows large.
        if map.len() > 10_000 {
            map.retain(|_, ts| now.duration_since(*ts) < self.ttl);
        }

        if let Some(ts) = map.get(event_id) {
            if now.duration_since(*ts) < self.ttl {
                return true;
            }
        }

        map.insert(event_id.to_owned(), now);
        false
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ChatEventBody {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    workspace_id: Option<String>,
    event: ChatEvent,
}

#[derive(Debug, Deserialize)]
struct ChatEvent {
    #[serde(rename = "type", default = "d_message")]
    event_type: String,
    user: String,
    channel: String,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    text: String,
}

fn d_message() -> String {
    "message".into()
}

#[derive(Debug, Deserialize)]
struct InteractiveBody {
    user: String,
    channel: String,
    #[serde(default)]
    thread_ts: Option<String>,
    action_id: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    workspace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlashBody {
    user: String,
    channel: String,
    command: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    workspace_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signature gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Verify `X-Signature`/`X-Timestamp` against the configured signing
/// secret before looking at the payload at all.
fn verify_chat_request(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), Response> {
    let secret = std::env::var(&state.config.chat.signing_secret_env).unwrap_or_default();
    if secret.is_empty() {
        tracing::error!(
            env_var = %state.config.chat.signing_secret_env,
            "chat signing secret not configured, rejecting"
        );
        return Err(api_error(selfserve_domain::Error::Unauthorized));
    }

    let timestamp = headers
        .get("x-timestamp")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    verify_signature(
        &secret,
        timestamp,
        signature,
        body,
        state.config.chat.timestamp_tolerance_secs,
    )
    .map_err(api_error)
}

fn ack() -> Response {
    Json(serde_json::json!({ "ok": true })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Background turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a chat turn after the ack. Turns in the same thread are
/// serialized by the per-thread queue, so platform bursts execute in
/// arrival order instead of bouncing off the turn lock.
fn spawn_chat_turn(state: AppState, user: String, handles: SurfaceHandles, text: String) {
    tokio::spawn(async move {
        let queue_key = format!(
            "chat:{}:{}",
            handles.channel_id.as_deref().unwrap_or("-"),
            handles.thread_id.as_deref().unwrap_or("-")
        );
        let _slot = state.turn_queues.acquire(&queue_key).await;

        let mut request = NormalizedRequest::new(&user, SurfaceKind::Chat, text);
        request.handles = handles.clone();
        request.integration_context = serde_json::json!({
            "channel": handles.channel_id,
            "thread_ts": handles.thread_id,
        });

        let request_id = request.request_id;
        match requests::run_sync_turn(&state, request).await {
            Ok(_) => {
                tracing::debug!(request_id = %request_id, "chat turn completed");
            }
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "chat turn failed");
            }
        }
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/v1/requests/chat_event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = verify_chat_request(&state, &headers, &body) {
        return resp;
    }

    let parsed: ChatEventBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return api_error(selfserve_domain::Error::BadRequest(format!(
                "malformed chat event: {e}"
            )))
        }
    };

    // Only message events start turns; everything else just acks.
    if parsed.event.event_type != "message" {
        return ack();
    }
    if parsed.event.text.trim().is_empty() {
        return ack();
    }

    if let Some(ref event_id) = parsed.event_id {
        if state.dedupe.check_and_insert(event_id) {
            tracing::debug!(event_id, "duplicate chat event ignored");
            return ack();
        }
    }

    let handles = SurfaceHandles {
        channel_id: Some(parsed.event.channel),
        thread_id: parsed.event.thread_ts,
        external_user_id: Some(parsed.event.user.clone()),
        workspace_id: parsed.workspace_id,
    };
    spawn_chat_turn(state, parsed.event.user, handles, parsed.event.text);

    ack()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/v1/requests/chat_interactive
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_interactive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = verify_chat_request(&state, &headers, &body) {
        return resp;
    }

    let parsed: InteractiveBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return api_error(selfserve_domain::Error::BadRequest(format!(
                "malformed interactive payload: {e}"
            )))
        }
    };

    let content = parsed.value.unwrap_or_else(|| parsed.action_id.clone());
    let handles = SurfaceHandles {
        channel_id: Some(parsed.channel),
        thread_id: parsed.thread_ts,
        external_user_id: Some(parsed.user.clone()),
        workspace_id: parsed.workspace_id,
    };
    spawn_chat_turn(state, parsed.user, handles, content);

    ack()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/v1/requests/chat_slash
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_slash(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = verify_chat_request(&state, &headers, &body) {
        return resp;
    }

    let parsed: SlashBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return api_error(selfserve_domain::Error::BadRequest(format!(
                "malformed slash command: {e}"
            )))
        }
    };

    let content = format!("{} {}", parsed.command, parsed.text);
    let handles = SurfaceHandles {
        channel_id: Some(parsed.channel),
        thread_id: None,
        external_user_id: Some(parsed.user.clone()),
        workspace_id: parsed.workspace_id,
    };
    spawn_chat_turn(state, parsed.user, handles, content.trim().to_owned());

    ack()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_store_rejects_duplicate() {
        let store = DedupeStore::new(Duration::from_secs(60));
        assert!(!store.check_and_insert("evt1"));
        assert!(store.check_and_insert("evt1"));
        assert!(!store.check_and_insert("evt2"));
    }

    #[test]
    fn dedupe_store_expires() {
        let store = DedupeStore::new(Duration::from_millis(0));
        assert!(!store.check_and_insert("evt1"));
        std::thread::sleep(Duration::from_millis(1));
        assert!(!store.check_and_insert("evt1"));
    }

    #[test]
    fn chat_event_parses_with_thread() {
        let raw = r#"{
            "event_id": "Ev123",
            "workspace_id": "T1",
            "event": {
                "type": "message",
                "user": "U42",
                "channel": "C7",
                "thread_ts": "171234.5678",
                "text": "hello there"
            }
        }"#;
        let parsed: ChatEventBody = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.event.user, "U42");
        assert_eq!(parsed.event.thread_ts.as_deref(), Some("171234.5678"));
    }

    #[test]
    fn slash_body_defaults_empty_text() {
        let raw = r#"{"user":"U1","channel":"C1","command":"/laptop"}"#;
        let parsed: SlashBody = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.text, "");
    }
}
