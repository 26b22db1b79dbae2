//! Direct-HTTP strategy: no broker, events POSTed straight to their
//! consumer. Used in development and CI.
//!
//! `send_request` POSTs the `request.created` envelope to the worker
//! in the background and parks the response body on the same waiter
//! rendezvous the broker strategy uses, so `await_response` behaves
//! identically on both paths.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use selfserve_domain::config::TransportConfig;
use selfserve_domain::{
    AgentResponse, ContextUpdate, Error, EventEnvelope, EventType, NormalizedRequest,
    ProcessingNotice, Result, TransportStrategy,
};

use crate::waiters::ResponseWaiters;
use crate::{DispatchAck, Transport};

pub struct DirectHttpTransport {
    http: reqwest::Client,
    worker_url: String,
    dispatcher_url: String,
    source: String,
    prefix: String,
    waiters: Arc<ResponseWaiters>,
}

impl DirectHttpTransport {
    pub fn new(config: &TransportConfig, source: &str) -> Result<Self> {
        // No client-level timeout: the worker call legitimately runs
        // as long as the agent runtime; the router's await deadline is
        // the real bound.
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Transport(format!("http client: {e}")))?;

        Ok(Self {
            http,
            worker_url: config.worker_url.trim_end_matches('/').to_owned(),
            dispatcher_url: config.dispatcher_url.trim_end_matches('/').to_owned(),
            source: source.to_owned(),
            prefix: config.nats.prefix.clone(),
            waiters: Arc::new(ResponseWaiters::new()),
        })
    }

    fn event_type(&self, event_type: EventType) -> String {
        format!("{}.{}", self.prefix, event_type.suffix())
    }
}

#[async_trait]
impl Transport for DirectHttpTransport {
    async fn send_request(
        &self,
        request: &NormalizedRequest,
        session_id: Uuid,
    ) -> Result<DispatchAck> {
        let envelope = EventEnvelope::new(
            &self.source,
            &self.event_type(EventType::RequestCreated),
            &session_id.to_string(),
            request,
        )?;

        self.waiters.register(request.request_id);

        let http = self.http.clone();
        let url = format!("{}/internal/v1/process", self.worker_url);
        let waiters = self.waiters.clone();
        let request_id = request.request_id;

        tokio::spawn(async move {
            let outcome = async {
                let response = http
                    .post(&url)
                    .json(&envelope)
                    .send()
                    .await
                    .map_err(|e| Error::Unavailable(format!("worker unreachable: {e}")))?;
                if !response.status().is_success() {
                    return Err(Error::Unavailable(format!(
                        "worker returned {}",
                        response.status()
                    )));
                }
                response
                    .json::<AgentResponse>()
                    .await
                    .map_err(|e| Error::Transport(format!("bad worker response: {e}")))
            }
            .await;

            if let Err(ref e) = outcome {
                tracing::warn!(request_id = %request_id, error = %e, "direct worker call failed");
            }
            waiters.complete(request_id, outcome);
        });

        // No broker event identity on this strategy.
        Ok(DispatchAck::default())
    }

    async fn await_response(&self, request_id: Uuid, timeout: Duration) -> Result<AgentResponse> {
        self.waiters.wait(request_id, timeout).await
    }

    async fn publish_processing(
        &self,
        notice: &ProcessingNotice,
        _session_id: Uuid,
    ) -> Result<()> {
        // No consumer on this strategy; the notice is observational.
        tracing::debug!(request_id = %notice.request_id, "request.processing (direct, no-op)");
        Ok(())
    }

    async fn publish_response(&self, response: &AgentResponse) -> Result<()> {
        let envelope = EventEnvelope::new(
            &self.source,
            &self.event_type(EventType::ResponseReady),
            &response.session_id.to_string(),
            response,
        )?;

        let url = format!("{}/internal/v1/dispatch", self.dispatcher_url);
        let reply = self
            .http
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("dispatcher unreachable: {e}")))?;

        if !reply.status().is_success() {
            return Err(Error::Unavailable(format!(
                "dispatcher returned {}",
                reply.status()
            )));
        }
        tracing::debug!(request_id = %response.request_id, "response.ready delivered");
        Ok(())
    }

    async fn publish_context_update(&self, update: &ContextUpdate) -> Result<()> {
        // The worker applies context updates to the store itself; on
        // this strategy there is no observer to notify.
        tracing::debug!(session_id = %update.session_id, "request.database-update (direct, no-op)");
        Ok(())
    }

    fn strategy(&self) -> TransportStrategy {
        TransportStrategy::DirectHttp
    }
}
