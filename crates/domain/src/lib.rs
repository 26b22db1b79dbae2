//! Shared domain types for the selfserve control plane.
//!
//! Everything the three services agree on lives here: configuration,
//! the closed error taxonomy, the persisted data model, the normalized
//! request record, and the event envelope used on the wire.

pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod request;

pub use config::{Config, ConfigError, ConfigSeverity, TransportStrategy};
pub use error::{Error, Result};
pub use event::{AgentResponse, ContextUpdate, EventEnvelope, EventType, ProcessingNotice};
pub use model::{
    BackoffShape, ConfigSource, DeliveryLog, DeliveryOutcome, EffectiveConfig,
    IntegrationDefault, IntegrationKind, RequestLog, RequestStatus, Session, SessionStatus,
    SurfaceHandles, SurfaceKind, UserIntegrationConfig,
};
pub use request::NormalizedRequest;
