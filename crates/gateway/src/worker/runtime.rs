//! Agent runtime boundary.
//!
//! The runtime is a best-effort collaborator behind a structured HTTP
//! call. Timeouts, bounded transport retries, and error classification
//! live here; semantic failures from the runtime are terminal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use selfserve_domain::config::RuntimeConfig;
use selfserve_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    session_handle: &'a str,
    agent_id: &'a str,
    prompt: &'a str,
    context: &'a Value,
}

/// Structured output of one runtime invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeReply {
    pub content: String,
    /// Present when a specialized agent should take the session over.
    #[serde(default)]
    pub routing_directive: Option<RoutingDirective>,
    /// Conversation-context changes to merge into the session.
    #[serde(default)]
    pub context_delta: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingDirective {
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
struct OpenSessionReply {
    handle: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait + HTTP implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Mint a runtime conversation handle for a session's first turn.
    async fn open_session(&self, session_id: Uuid, user_id: &str) -> Result<String>;

    /// One agent invocation, bounded by the configured deadline.
    async fn invoke(
        &self,
        handle: &str,
        agent_id: &str,
        prompt: &str,
        context: &Value,
    ) -> Result<RuntimeReply>;
}

pub struct HttpAgentRuntime {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl HttpAgentRuntime {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("runtime client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            max_retries: config.max_retries,
        })
    }

    fn classify(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout("agent runtime deadline exceeded".into())
        } else if e.is_connect() || e.is_request() {
            Error::Unavailable(format!("agent runtime unreachable: {e}"))
        } else {
            Error::Internal(format!("agent runtime: {e}"))
        }
    }

    /// POST with bounded retries on transport errors only. A 4xx/5xx
    /// from the runtime is semantic and terminal.
    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(250 * attempt as u64)).await;
                tracing::debug!(url, attempt, "retrying runtime call");
            }

            match self.http.post(&url).json(body).send().await {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(Error::Internal(format!(
                            "agent runtime returned {}",
                            response.status()
                        )));
                    }
                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| Error::Internal(format!("bad runtime reply: {e}")));
                }
                Err(e) => {
                    let classified = Self::classify(e);
                    if !classified.is_retryable() {
                        return Err(classified);
                    }
                    last_err = Some(classified);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Unavailable("agent runtime unreachable".into())))
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn open_session(&self, session_id: Uuid, user_id: &str) -> Result<String> {
        let reply: OpenSessionReply = self
            .post_json(
                "/v1/sessions",
                &serde_json::json!({ "session_id": session_id, "user_id": user_id }),
            )
            .await?;
        Ok(reply.handle)
    }

    async fn invoke(
        &self,
        handle: &str,
        agent_id: &str,
        prompt: &str,
        context: &Value,
    ) -> Result<RuntimeReply> {
        self.post_json(
            "/v1/invoke",
            &InvokeRequest {
                session_handle: handle,
                agent_id,
                prompt,
                context,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_parses_minimal_shape() {
        let reply: RuntimeReply = serde_json::from_str(r#"{"content":"hello"}"#).unwrap();
        assert_eq!(reply.content, "hello");
        assert!(reply.routing_directive.is_none());
        assert!(reply.context_delta.is_none());
    }

    #[test]
    fn reply_parses_routing_directive() {
        let reply: RuntimeReply = serde_json::from_str(
            r#"{"content":"","routing_directive":{"agent_id":"hardware-support"}}"#,
        )
        .unwrap();
        assert_eq!(reply.routing_directive.unwrap().agent_id, "hardware-support");
    }
}
