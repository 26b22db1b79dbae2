//! Serial execution of chat turns, one queue per thread.
//!
//! The chat surface acks before doing any work, so a burst of
//! messages in one thread becomes a burst of background tasks. Each
//! `(channel, thread)` key owns a single-permit slot; tasks line up on
//! it and run their turn in arrival order, which keeps the store-level
//! turn lock uncontended on the chat path. Synchronous surfaces never
//! come through here — they surface `conflict` instead of queueing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct TurnQueueMap {
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for TurnQueueMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnQueueMap {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for the slot belonging to `thread_key`. The returned
    /// permit is held for the whole turn and releases on drop, waking
    /// the next queued message in that thread.
    pub async fn acquire(&self, thread_key: &str) -> OwnedSemaphorePermit {
        let slot = self
            .slots
            .lock()
            .entry(thread_key.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        // Slots are never closed, so acquisition cannot fail.
        match slot.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("turn queue slot closed"),
        }
    }

    /// Number of threads currently tracked (for monitoring).
    pub fn thread_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Forget threads that have gone quiet. A running turn holds an
    /// `Arc` clone through its permit, and a queued message holds one
    /// through its pending acquire, so a slot whose only reference is
    /// the map itself has neither — dropping it cannot reorder or
    /// strand anything.
    pub fn prune_quiet(&self) {
        self.slots
            .lock()
            .retain(|_, slot| Arc::strong_count(slot) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permit_release_lets_next_turn_run() {
        let queues = TurnQueueMap::new();
        let first = queues.acquire("chat:C1:t1").await;
        drop(first);
        let second = queues.acquire("chat:C1:t1").await;
        drop(second);
    }

    #[tokio::test]
    async fn separate_threads_run_concurrently() {
        let queues = Arc::new(TurnQueueMap::new());
        let a = queues.acquire("chat:C1:t1").await;
        let b = queues.acquire("chat:C1:t2").await;
        assert_eq!(queues.thread_count(), 2);
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn same_thread_messages_run_in_order() {
        let queues = Arc::new(TurnQueueMap::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = queues.acquire("chat:C1:t1").await;

        let queues2 = queues.clone();
        let order2 = order.clone();
        let second = tokio::spawn(async move {
            let _permit = queues2.acquire("chat:C1:t1").await;
            order2.lock().push("second");
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        order.lock().push("first");
        drop(first);
        second.await.unwrap();

        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn prune_drops_only_quiet_threads() {
        let queues = Arc::new(TurnQueueMap::new());

        // A thread mid-turn.
        let held = queues.acquire("busy").await;

        // A thread with a turn running and a message queued behind it.
        let blocker = queues.acquire("backlogged").await;
        let queues2 = queues.clone();
        let waiter = tokio::spawn(async move {
            let _permit = queues2.acquire("backlogged").await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // A thread that finished its turn.
        drop(queues.acquire("quiet").await);

        queues.prune_quiet();
        assert_eq!(queues.thread_count(), 2);

        drop(blocker);
        waiter.await.unwrap();
        drop(held);

        queues.prune_quiet();
        assert_eq!(queues.thread_count(), 0);
    }
}
