//! Communication Substrate — one contract, two strategies.
//!
//! The broker strategy publishes CloudEvents-shaped envelopes on NATS
//! subjects; the direct-HTTP strategy POSTs the same envelopes straight
//! to the worker and dispatcher. Callers observe identical behavior on
//! both paths: the same store mutations, the same log lines, the same
//! awaited-response rendezvous.

pub mod broker;
pub mod direct;
pub mod waiters;

pub use broker::BrokerTransport;
pub use direct::DirectHttpTransport;
pub use waiters::ResponseWaiters;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use selfserve_domain::{
    AgentResponse, Config, ContextUpdate, NormalizedRequest, ProcessingNotice, Result,
    TransportStrategy,
};

/// Acknowledgement for a produced event. Carries the broker event
/// identity so the router can record it on the request log; the
/// direct-HTTP strategy leaves both unset.
#[derive(Debug, Clone, Default)]
pub struct DispatchAck {
    pub event_id: Option<String>,
    pub event_type: Option<String>,
}

/// The substrate contract shared by router, worker, and dispatcher.
///
/// `subscribe` is intentionally absent: only the broker strategy has
/// one, exposed on [`BrokerTransport`] directly. On the direct-HTTP
/// strategy the worker and dispatcher are plain HTTP endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Produce `request.created` for the given turn.
    async fn send_request(
        &self,
        request: &NormalizedRequest,
        session_id: Uuid,
    ) -> Result<DispatchAck>;

    /// Block until `response.ready` for `request_id` arrives, or the
    /// timeout elapses.
    async fn await_response(&self, request_id: Uuid, timeout: Duration) -> Result<AgentResponse>;

    /// Produce `request.processing`.
    async fn publish_processing(
        &self,
        notice: &ProcessingNotice,
        session_id: Uuid,
    ) -> Result<()>;

    /// Produce `response.ready`.
    async fn publish_response(&self, response: &AgentResponse) -> Result<()>;

    /// Produce `request.database-update`.
    async fn publish_context_update(&self, update: &ContextUpdate) -> Result<()>;

    fn strategy(&self) -> TransportStrategy;
}

/// The transport a service booted with. Consumers that need the
/// broker's `subscribe` (worker, dispatcher) match on the variant;
/// everything else goes through [`BuiltTransport::as_dyn`].
#[derive(Clone)]
pub enum BuiltTransport {
    Broker(Arc<BrokerTransport>),
    Direct(Arc<DirectHttpTransport>),
}

impl BuiltTransport {
    pub fn as_dyn(&self) -> Arc<dyn Transport> {
        match self {
            BuiltTransport::Broker(t) => t.clone(),
            BuiltTransport::Direct(t) => t.clone(),
        }
    }

    pub fn strategy(&self) -> TransportStrategy {
        match self {
            BuiltTransport::Broker(_) => TransportStrategy::Broker,
            BuiltTransport::Direct(_) => TransportStrategy::DirectHttp,
        }
    }
}

/// Build the configured strategy. `source` names the producing service
/// in event envelopes (e.g. `selfserve.router`).
pub async fn build(config: &Config, source: &str) -> Result<BuiltTransport> {
    match config.transport.strategy {
        TransportStrategy::Broker => {
            let broker = BrokerTransport::connect(&config.transport.nats, source).await?;
            Ok(BuiltTransport::Broker(Arc::new(broker)))
        }
        TransportStrategy::DirectHttp => Ok(BuiltTransport::Direct(Arc::new(
            DirectHttpTransport::new(&config.transport, source)?,
        ))),
    }
}
