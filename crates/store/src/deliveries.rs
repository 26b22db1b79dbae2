//! Delivery attempt logs, atomic event claims, and the persistent
//! retry queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use selfserve_domain::{DeliveryLog, DeliveryOutcome, IntegrationKind, Result};

use crate::{parse_ts, sql_err, ts, Store};

/// A scheduled redelivery waiting for its `next_attempt_at`.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub request_id: Uuid,
    pub kind: IntegrationKind,
    pub user_id: String,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
}

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<DeliveryLog> {
    let request_id: String = row.get(0)?;
    let kind: String = row.get(2)?;
    let outcome: String = row.get(4)?;
    let started_at: String = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;

    Ok(DeliveryLog {
        request_id: request_id.parse().unwrap_or_default(),
        user_id: row.get(1)?,
        kind: kind.parse().unwrap_or(IntegrationKind::Test),
        attempt: row.get::<_, i64>(3)? as u32,
        outcome: outcome.parse().unwrap_or(DeliveryOutcome::Failed),
        error: row.get(5)?,
        started_at: parse_ts(&started_at).unwrap_or_default(),
        completed_at: completed_at.and_then(|raw| parse_ts(&raw).ok()),
    })
}

impl Store {
    /// Open the next delivery attempt for `(request, kind)`. The
    /// attempt index is computed inside the transaction, so indices
    /// form a contiguous series starting at 1.
    pub fn begin_delivery(
        &self,
        request_id: Uuid,
        user_id: &str,
        kind: IntegrationKind,
    ) -> Result<u32> {
        let now = ts(Utc::now());

        self.with_tx(|tx| {
            let attempt: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(attempt), 0) + 1 FROM delivery_logs \
                     WHERE request_id = ?1 AND kind = ?2",
                    params![request_id.to_string(), kind.as_str()],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;

            tx.execute(
                "INSERT INTO delivery_logs \
                 (request_id, user_id, kind, attempt, outcome, started_at) \
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                params![request_id.to_string(), user_id, kind.as_str(), attempt, now],
            )
            .map_err(sql_err)?;

            Ok(attempt as u32)
        })
    }

    /// Close an attempt with its outcome. Rows are append-only; only
    /// the open `pending` row for the attempt is finalized.
    pub fn finish_delivery(
        &self,
        request_id: Uuid,
        kind: IntegrationKind,
        attempt: u32,
        outcome: DeliveryOutcome,
        error: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE delivery_logs SET outcome = ?1, error = ?2, completed_at = ?3 \
                 WHERE request_id = ?4 AND kind = ?5 AND attempt = ?6 AND outcome = 'pending'",
                params![
                    outcome.as_str(),
                    error,
                    ts(Utc::now()),
                    request_id.to_string(),
                    kind.as_str(),
                    attempt as i64
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    /// All attempts for a request, oldest first.
    pub fn list_deliveries(&self, request_id: Uuid) -> Result<Vec<DeliveryLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT request_id, user_id, kind, attempt, outcome, error, started_at, \
                     completed_at FROM delivery_logs WHERE request_id = ?1 \
                     ORDER BY kind, attempt",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![request_id.to_string()], delivery_from_row)
                .map_err(sql_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
        })
    }

    /// Atomic event claim: exactly one instance across all replicas
    /// wins the insert and processes the event.
    pub fn claim_event(&self, event_id: &str, instance: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "INSERT OR IGNORE INTO event_claims (event_id, claimed_by, claimed_at) \
                     VALUES (?1, ?2, ?3)",
                    params![event_id, instance, ts(Utc::now())],
                )
                .map_err(sql_err)?;
            Ok(changed == 1)
        })
    }

    /// Persist a redelivery for a failed attempt. Survives restarts;
    /// the retry runner claims due rows on its tick.
    pub fn schedule_redelivery(&self, pending: &PendingDelivery) -> Result<()> {
        let raw = serde_json::to_string(&pending.payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_deliveries \
                 (request_id, kind, user_id, payload, attempt, next_attempt_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT (request_id, kind) DO UPDATE SET \
                   attempt = excluded.attempt, next_attempt_at = excluded.next_attempt_at",
                params![
                    pending.request_id.to_string(),
                    pending.kind.as_str(),
                    pending.user_id,
                    raw,
                    pending.attempt as i64,
                    ts(pending.next_attempt_at)
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    /// Claim every redelivery that is due. The rows are deleted inside
    /// the claiming transaction — each attempt is a fresh claim, so a
    /// crash before completion simply reschedules on failure handling
    /// of the next attempt.
    pub fn claim_due_redeliveries(&self, limit: usize) -> Result<Vec<PendingDelivery>> {
        let now = ts(Utc::now());

        self.with_tx(|tx| {
            let mut due = Vec::new();
            {
                let mut stmt = tx
                    .prepare(
                        "SELECT request_id, kind, user_id, payload, attempt, next_attempt_at \
                         FROM pending_deliveries WHERE next_attempt_at <= ?1 \
                         ORDER BY next_attempt_at LIMIT ?2",
                    )
                    .map_err(sql_err)?;
                let rows = stmt
                    .query_map(params![now, limit as i64], |row| {
                        let request_id: String = row.get(0)?;
                        let kind: String = row.get(1)?;
                        let payload: String = row.get(3)?;
                        let next_attempt_at: String = row.get(5)?;
                        Ok((
                            request_id,
                            kind,
                            row.get::<_, String>(2)?,
                            payload,
                            row.get::<_, i64>(4)?,
                            next_attempt_at,
                        ))
                    })
                    .map_err(sql_err)?;

                for row in rows {
                    let (request_id, kind, user_id, payload, attempt, next_attempt_at) =
                        row.map_err(sql_err)?;
                    due.push(PendingDelivery {
                        request_id: request_id.parse().unwrap_or_default(),
                        kind: kind.parse().unwrap_or(IntegrationKind::Test),
                        user_id,
                        payload: serde_json::from_str(&payload).unwrap_or_default(),
                        attempt: attempt as u32,
                        next_attempt_at: parse_ts(&next_attempt_at).unwrap_or_default(),
                    });
                }
            }

            for pending in &due {
                tx.execute(
                    "DELETE FROM pending_deliveries WHERE request_id = ?1 AND kind = ?2",
                    params![pending.request_id.to_string(), pending.kind.as_str()],
                )
                .map_err(sql_err)?;
            }

            Ok(due)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory(Vec::new()).unwrap()
    }

    #[test]
    fn attempts_are_contiguous_from_one() {
        let store = store();
        let request_id = Uuid::new_v4();

        for expected in 1..=3u32 {
            let attempt = store
                .begin_delivery(request_id, "bob", IntegrationKind::Webhook)
                .unwrap();
            assert_eq!(attempt, expected);
            store
                .finish_delivery(
                    request_id,
                    IntegrationKind::Webhook,
                    attempt,
                    DeliveryOutcome::Failed,
                    Some("upstream returned 503"),
                )
                .unwrap();
        }

        let logs = store.list_deliveries(request_id).unwrap();
        let indices: Vec<u32> = logs.iter().map(|l| l.attempt).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn kinds_count_attempts_independently() {
        let store = store();
        let request_id = Uuid::new_v4();

        assert_eq!(
            store.begin_delivery(request_id, "bob", IntegrationKind::Webhook).unwrap(),
            1
        );
        assert_eq!(
            store.begin_delivery(request_id, "bob", IntegrationKind::Email).unwrap(),
            1
        );
    }

    #[test]
    fn event_claim_has_a_single_winner() {
        let store = store();
        assert!(store.claim_event("evt-1", "pod-a").unwrap());
        assert!(!store.claim_event("evt-1", "pod-b").unwrap());
        assert!(store.claim_event("evt-2", "pod-b").unwrap());
    }

    #[test]
    fn redelivery_claim_is_due_gated_and_one_shot() {
        let store = store();
        let request_id = Uuid::new_v4();

        store
            .schedule_redelivery(&PendingDelivery {
                request_id,
                kind: IntegrationKind::Webhook,
                user_id: "bob".into(),
                payload: serde_json::json!({"body": "hi"}),
                attempt: 2,
                next_attempt_at: Utc::now() + chrono::Duration::hours(1),
            })
            .unwrap();

        // Not due yet.
        assert!(store.claim_due_redeliveries(10).unwrap().is_empty());

        store
            .schedule_redelivery(&PendingDelivery {
                request_id,
                kind: IntegrationKind::Webhook,
                user_id: "bob".into(),
                payload: serde_json::json!({"body": "hi"}),
                attempt: 2,
                next_attempt_at: Utc::now() - chrono::Duration::seconds(1),
            })
            .unwrap();

        let due = store.claim_due_redeliveries(10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt, 2);
        // The claim removed the row.
        assert!(store.claim_due_redeliveries(10).unwrap().is_empty());
    }

    #[test]
    fn finish_only_touches_the_open_attempt() {
        let store = store();
        let request_id = Uuid::new_v4();
        let attempt = store
            .begin_delivery(request_id, "bob", IntegrationKind::Test)
            .unwrap();
        store
            .finish_delivery(request_id, IntegrationKind::Test, attempt, DeliveryOutcome::Success, None)
            .unwrap();
        // Finishing again is a no-op on the already-closed row.
        store
            .finish_delivery(
                request_id,
                IntegrationKind::Test,
                attempt,
                DeliveryOutcome::Failed,
                Some("should not overwrite"),
            )
            .unwrap();

        let logs = store.list_deliveries(request_id).unwrap();
        assert_eq!(logs[0].outcome, DeliveryOutcome::Success);
        assert!(logs[0].error.is_none());
    }
}
