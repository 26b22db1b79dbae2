//! Broker strategy: CloudEvents envelopes on NATS subjects.
//!
//! Subjects are `{prefix}.{event type suffix}` (e.g.
//! `selfserve.request.created`). Consumers join a per-service queue
//! group so horizontally scaled replicas share the stream, and bound
//! their in-flight work with a semaphore.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use selfserve_domain::config::NatsConfig;
use selfserve_domain::{
    AgentResponse, ContextUpdate, Error, EventEnvelope, EventType, NormalizedRequest,
    ProcessingNotice, Result, TransportStrategy,
};

use crate::waiters::ResponseWaiters;
use crate::{DispatchAck, Transport};

pub struct BrokerTransport {
    client: async_nats::Client,
    prefix: String,
    source: String,
    waiters: Arc<ResponseWaiters>,
}

impl BrokerTransport {
    /// Connect to the broker. The connection token, if any, comes from
    /// the env var named in config — never from the config file itself.
    pub async fn connect(config: &NatsConfig, source: &str) -> Result<Self> {
        let token = std::env::var(&config.token_env).ok().filter(|t| !t.is_empty());
        let opts = match token {
            Some(token) => async_nats::ConnectOptions::with_token(token),
            None => async_nats::ConnectOptions::new(),
        }
        .retry_on_initial_connect();

        tracing::info!(url = %config.url, prefix = %config.prefix, "connecting to broker");
        let client = opts
            .connect(&config.url)
            .await
            .map_err(|e| Error::Transport(format!("broker connect: {e}")))?;
        tracing::info!("broker connected");

        Ok(Self {
            client,
            prefix: config.prefix.clone(),
            source: source.to_owned(),
            waiters: Arc::new(ResponseWaiters::new()),
        })
    }

    fn subject(&self, event_type: EventType) -> String {
        format!("{}.{}", self.prefix, event_type.suffix())
    }

    async fn publish(&self, envelope: &EventEnvelope, subject: String) -> Result<()> {
        let payload = serde_json::to_vec(envelope)?;
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| Error::Transport(format!("broker publish: {e}")))?;
        Ok(())
    }

    /// Spawn the router-side listener that resolves awaited responses.
    /// Every router replica sees every `response.ready` (no queue
    /// group) and resolves only the waiters it owns.
    pub fn spawn_response_listener(&self, shutdown: CancellationToken) {
        let client = self.client.clone();
        let subject = self.subject(EventType::ResponseReady);
        let waiters = self.waiters.clone();

        tokio::spawn(async move {
            let mut sub = match client.subscribe(subject.clone()).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::error!(subject, error = %e, "response listener subscribe failed");
                    return;
                }
            };
            tracing::info!(subject, "response listener subscribed");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        let envelope: EventEnvelope = match serde_json::from_slice(&msg.payload) {
                            Ok(env) => env,
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping malformed response envelope");
                                continue;
                            }
                        };
                        match envelope.payload::<AgentResponse>() {
                            Ok(response) => {
                                waiters.complete(response.request_id, Ok(response));
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping malformed response payload");
                            }
                        }
                    }
                }
            }
            tracing::debug!("response listener shutting down");
        });
    }

    /// Spawn a queue-group subscriber for one event type. Delivery is
    /// at-least-once; handlers are responsible for idempotency. At
    /// most `max_in_flight` envelopes are processed concurrently.
    pub fn spawn_subscriber<F, Fut>(
        &self,
        event_type: EventType,
        queue_group: &str,
        max_in_flight: usize,
        shutdown: CancellationToken,
        handler: F,
    ) where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let client = self.client.clone();
        let subject = self.subject(event_type);
        let queue_group = queue_group.to_owned();
        let handler = Arc::new(handler);
        let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));

        tokio::spawn(async move {
            let mut sub = match client.queue_subscribe(subject.clone(), queue_group.clone()).await
            {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::error!(subject, error = %e, "subscriber failed to start");
                    return;
                }
            };
            tracing::info!(subject, queue_group, "subscriber started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        let envelope: EventEnvelope = match serde_json::from_slice(&msg.payload) {
                            Ok(env) => env,
                            Err(e) => {
                                tracing::warn!(subject = %msg.subject, error = %e, "dropping malformed envelope");
                                continue;
                            }
                        };
                        let permit = match permits.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        let work = handler.as_ref()(envelope);
                        tokio::spawn(async move {
                            work.await;
                            drop(permit);
                        });
                    }
                }
            }
            tracing::debug!(subject, "subscriber shutting down");
        });
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn send_request(
        &self,
        request: &NormalizedRequest,
        session_id: Uuid,
    ) -> Result<DispatchAck> {
        // Register before publishing so a fast response cannot slip
        // past the rendezvous.
        self.waiters.register(request.request_id);

        let envelope = EventEnvelope::new(
            &self.source,
            &format!("{}.{}", self.prefix, EventType::RequestCreated.suffix()),
            &session_id.to_string(),
            request,
        )?;
        let ack = DispatchAck {
            event_id: Some(envelope.id.clone()),
            event_type: Some(envelope.event_type.clone()),
        };

        if let Err(e) = self
            .publish(&envelope, self.subject(EventType::RequestCreated))
            .await
        {
            self.waiters.abandon(request.request_id);
            return Err(e);
        }

        tracing::debug!(
            request_id = %request.request_id,
            event_id = %envelope.id,
            "request.created published"
        );
        Ok(ack)
    }

    async fn await_response(&self, request_id: Uuid, timeout: Duration) -> Result<AgentResponse> {
        self.waiters.wait(request_id, timeout).await
    }

    async fn publish_processing(
        &self,
        notice: &ProcessingNotice,
        session_id: Uuid,
    ) -> Result<()> {
        let envelope = EventEnvelope::new(
            &self.source,
            &format!("{}.{}", self.prefix, EventType::RequestProcessing.suffix()),
            &session_id.to_string(),
            notice,
        )?;
        self.publish(&envelope, self.subject(EventType::RequestProcessing))
            .await
    }

    async fn publish_response(&self, response: &AgentResponse) -> Result<()> {
        let envelope = EventEnvelope::new(
            &self.source,
            &format!("{}.{}", self.prefix, EventType::ResponseReady.suffix()),
            &response.session_id.to_string(),
            response,
        )?;
        self.publish(&envelope, self.subject(EventType::ResponseReady))
            .await?;
        tracing::debug!(
            request_id = %response.request_id,
            event_id = %envelope.id,
            "response.ready published"
        );
        Ok(())
    }

    async fn publish_context_update(&self, update: &ContextUpdate) -> Result<()> {
        let envelope = EventEnvelope::new(
            &self.source,
            &format!("{}.{}", self.prefix, EventType::DatabaseUpdate.suffix()),
            &update.session_id.to_string(),
            update,
        )?;
        self.publish(&envelope, self.subject(EventType::DatabaseUpdate))
            .await
    }

    fn strategy(&self) -> TransportStrategy {
        TransportStrategy::Broker
    }
}
