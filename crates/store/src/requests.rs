//! Request-log operations: one row per turn, with idempotent
//! completion for at-least-once event delivery.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use selfserve_domain::{Error, NormalizedRequest, RequestLog, RequestStatus, Result};

use crate::{parse_ts, sql_err, ts, Store};

/// Outcome of a worker's attempt to claim a request for processing.
#[derive(Debug)]
pub enum DispatchClaim {
    /// The claim succeeded; the caller owns processing.
    Claimed,
    /// Another worker finished first — the stored response is returned
    /// so duplicates resolve deterministically.
    AlreadyCompleted(Box<RequestLog>),
    /// Another worker holds the claim right now; drop the duplicate.
    InFlight,
}

const LOG_COLUMNS: &str = "id, session_id, request, response, agent_id, processing_ms, \
     event_id, event_type, status, created_at, completed_at";

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<RequestLog> {
    let id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let request: String = row.get(2)?;
    let response: Option<String> = row.get(3)?;
    let status: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;

    Ok(RequestLog {
        id: id.parse().unwrap_or_default(),
        session_id: session_id.parse().unwrap_or_default(),
        request: serde_json::from_str(&request).unwrap_or_default(),
        response: response.and_then(|raw| serde_json::from_str(&raw).ok()),
        agent_id: row.get(4)?,
        processing_ms: row.get(5)?,
        event_id: row.get(6)?,
        event_type: row.get(7)?,
        status: status.parse().unwrap_or(RequestStatus::Failed),
        created_at: parse_ts(&created_at).unwrap_or_default(),
        completed_at: completed_at.and_then(|raw| parse_ts(&raw).ok()),
    })
}

impl Store {
    /// Insert the log row for a new turn (`status = pending`) and bump
    /// the session's request counter, in one transaction.
    pub fn append_log(&self, session_id: Uuid, request: &NormalizedRequest) -> Result<Uuid> {
        let now = ts(Utc::now());
        let raw = serde_json::to_string(request)?;

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO request_logs (id, session_id, request, status, created_at) \
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![
                    request.request_id.to_string(),
                    session_id.to_string(),
                    raw,
                    now
                ],
            )
            .map_err(sql_err)?;

            tx.execute(
                "UPDATE sessions SET request_count = request_count + 1, updated_at = ?1 \
                 WHERE id = ?2",
                params![now, session_id.to_string()],
            )
            .map_err(sql_err)?;

            Ok(request.request_id)
        })
    }

    /// Record the transport event id/type once the envelope is on the
    /// wire. Left unset on the direct-HTTP strategy.
    pub fn set_log_event(
        &self,
        request_id: Uuid,
        event_id: &str,
        event_type: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE request_logs SET event_id = ?1, event_type = ?2 WHERE id = ?3",
                params![event_id, event_type, request_id.to_string()],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    /// Claim a request for processing. Duplicate `request.created`
    /// deliveries resolve here: a completed log short-circuits with
    /// the stored response, an in-flight claim drops the duplicate.
    pub fn claim_dispatch(&self, request_id: Uuid) -> Result<DispatchClaim> {
        self.with_tx(|tx| {
            let log = tx
                .query_row(
                    &format!("SELECT {LOG_COLUMNS} FROM request_logs WHERE id = ?1"),
                    params![request_id.to_string()],
                    log_from_row,
                )
                .optional()
                .map_err(sql_err)?
                .ok_or_else(|| Error::Store(format!("request {request_id} not found")))?;

            match log.status {
                RequestStatus::Completed => Ok(DispatchClaim::AlreadyCompleted(Box::new(log))),
                RequestStatus::Dispatched => Ok(DispatchClaim::InFlight),
                RequestStatus::Pending | RequestStatus::Failed => {
                    tx.execute(
                        "UPDATE request_logs SET status = 'dispatched' WHERE id = ?1",
                        params![request_id.to_string()],
                    )
                    .map_err(sql_err)?;
                    Ok(DispatchClaim::Claimed)
                }
            }
        })
    }

    /// Transition a log to `completed` with the response payload.
    ///
    /// Idempotent: a repeat call with the same payload is a no-op, and
    /// the first completion always wins. A late response overwrites a
    /// `failed/timeout` marker so it can still be delivered.
    /// Returns `true` when this call performed the transition.
    pub fn complete_log(
        &self,
        request_id: Uuid,
        response: &serde_json::Value,
        agent_id: Option<&str>,
        processing_ms: i64,
    ) -> Result<bool> {
        let now = ts(Utc::now());
        let raw = serde_json::to_string(response)?;

        self.with_tx(|tx| {
            let current: Option<(String, Option<String>)> = tx
                .query_row(
                    "SELECT status, response FROM request_logs WHERE id = ?1",
                    params![request_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_err)?;

            let (status, stored) = current
                .ok_or_else(|| Error::Store(format!("request {request_id} not found")))?;

            if status == "completed" {
                if stored.as_deref() != Some(raw.as_str()) {
                    tracing::warn!(
                        request_id = %request_id,
                        "duplicate completion with a different payload, keeping the first"
                    );
                }
                return Ok(false);
            }

            tx.execute(
                "UPDATE request_logs SET response = ?1, agent_id = ?2, processing_ms = ?3, \
                 status = 'completed', completed_at = ?4 WHERE id = ?5",
                params![raw, agent_id, processing_ms, now, request_id.to_string()],
            )
            .map_err(sql_err)?;
            Ok(true)
        })
    }

    /// Mark a log `failed` (router timeout, worker error). Never
    /// clobbers a completed log.
    pub fn fail_log(&self, request_id: Uuid, reason: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE request_logs SET status = 'failed', completed_at = ?1 \
                     WHERE id = ?2 AND status != 'completed'",
                    params![ts(Utc::now()), request_id.to_string()],
                )
                .map_err(sql_err)?;
            if changed == 1 {
                tracing::warn!(request_id = %request_id, reason, "request marked failed");
            }
            Ok(())
        })
    }

    pub fn get_log(&self, request_id: Uuid) -> Result<Option<RequestLog>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {LOG_COLUMNS} FROM request_logs WHERE id = ?1"),
                params![request_id.to_string()],
                log_from_row,
            )
            .optional()
            .map_err(sql_err)
        })
    }
}
