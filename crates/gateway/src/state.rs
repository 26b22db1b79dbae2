use std::sync::Arc;

use selfserve_domain::Config;
use selfserve_store::Store;
use selfserve_transport::Transport;

use crate::api::auth::CredentialResolver;
use crate::api::chat::DedupeStore;
use crate::turn_queue::TurnQueueMap;

/// Shared state for the request-router service, passed to every API
/// handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub transport: Arc<dyn Transport>,
    /// Credential resolver chain (JWT → API key → trusted proxy).
    pub resolver: Arc<CredentialResolver>,
    /// Idempotency store for inbound chat event deduplication.
    pub dedupe: Arc<DedupeStore>,
    /// Per-thread serial queues for the chat surface.
    pub turn_queues: Arc<TurnQueueMap>,
}
