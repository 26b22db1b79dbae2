//! Request-scoped rendezvous for awaited responses.
//!
//! `send_request` registers a waiter keyed by request id *before* the
//! event leaves the process, so a response arriving between send and
//! await is never lost. `await_response` claims the parked receiver
//! and blocks on it with a deadline.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use selfserve_domain::{AgentResponse, Error, Result};

type Waiter = oneshot::Sender<Result<AgentResponse>>;
type Parked = oneshot::Receiver<Result<AgentResponse>>;

#[derive(Default)]
pub struct ResponseWaiters {
    senders: Mutex<HashMap<Uuid, Waiter>>,
    receivers: Mutex<HashMap<Uuid, Parked>>,
}

impl ResponseWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `request_id`. Replaces (and cancels) any
    /// stale registration for the same id.
    pub fn register(&self, request_id: Uuid) {
        let (tx, rx) = oneshot::channel();
        if self.senders.lock().insert(request_id, tx).is_some() {
            tracing::warn!(request_id = %request_id, "replaced a stale response waiter");
        }
        self.receivers.lock().insert(request_id, rx);
    }

    /// Deliver a result to the waiter, if one is registered.
    /// Returns `false` when nobody is waiting (e.g. the router timed
    /// out and abandoned the turn, or another replica owns it).
    pub fn complete(&self, request_id: Uuid, result: Result<AgentResponse>) -> bool {
        match self.senders.lock().remove(&request_id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Block until the registered waiter resolves or the deadline
    /// passes. Cleans up the registration either way.
    pub async fn wait(&self, request_id: Uuid, timeout: Duration) -> Result<AgentResponse> {
        let rx = self
            .receivers
            .lock()
            .remove(&request_id)
            .ok_or_else(|| {
                Error::Internal(format!("no response waiter registered for {request_id}"))
            })?;

        let outcome = tokio::time::timeout(timeout, rx).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport(
                "response channel closed before a response arrived".into(),
            )),
            Err(_) => {
                self.senders.lock().remove(&request_id);
                Err(Error::Timeout(format!(
                    "no response for request {request_id} within {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Drop a registration without waiting (error cleanup paths).
    pub fn abandon(&self, request_id: Uuid) {
        self.senders.lock().remove(&request_id);
        self.receivers.lock().remove(&request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.senders.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request_id: Uuid) -> AgentResponse {
        AgentResponse {
            request_id,
            session_id: Uuid::new_v4(),
            agent_id: None,
            content: "ok".into(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn completes_before_wait_is_not_lost() {
        let waiters = ResponseWaiters::new();
        let id = Uuid::new_v4();

        waiters.register(id);
        assert!(waiters.complete(id, Ok(response(id))));

        let got = waiters.wait(id, Duration::from_millis(50)).await.unwrap();
        assert_eq!(got.request_id, id);
    }

    #[tokio::test]
    async fn wait_times_out_and_cleans_up() {
        let waiters = ResponseWaiters::new();
        let id = Uuid::new_v4();

        waiters.register(id);
        let err = waiters.wait(id, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(waiters.pending_count(), 0);

        // A late response finds nobody waiting.
        assert!(!waiters.complete(id, Ok(response(id))));
    }

    #[tokio::test]
    async fn complete_without_registration_is_false() {
        let waiters = ResponseWaiters::new();
        let id = Uuid::new_v4();
        assert!(!waiters.complete(id, Ok(response(id))));
    }

    #[tokio::test]
    async fn error_results_propagate() {
        let waiters = ResponseWaiters::new();
        let id = Uuid::new_v4();
        waiters.register(id);
        waiters.complete(id, Err(Error::Unavailable("worker unreachable".into())));
        let err = waiters.wait(id, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
