//! Session operations, including the turn lock.

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use selfserve_domain::{
    Error, Result, Session, SessionStatus, SurfaceHandles, SurfaceKind,
};

use crate::{parse_ts, sql_err, ts, Store};

/// Proof of turn ownership. Only the holder may release the turn.
#[derive(Debug, Clone)]
pub struct TurnToken {
    pub session_id: Uuid,
    pub token: Uuid,
}

const SESSION_COLUMNS: &str = "id, user_id, surface, channel_id, thread_id, external_user_id, \
     workspace_id, current_agent_id, runtime_handle, status, context, integration_metadata, \
     user_context, request_count, created_at, updated_at, last_activity_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let id: String = row.get(0)?;
    let surface: String = row.get(2)?;
    let status: String = row.get(9)?;
    let context: String = row.get(10)?;
    let integration_metadata: String = row.get(11)?;
    let user_context: String = row.get(12)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;
    let last_activity_at: String = row.get(16)?;

    Ok(Session {
        id: id.parse().unwrap_or_default(),
        user_id: row.get(1)?,
        surface: surface.parse::<SurfaceKind>().unwrap_or(SurfaceKind::Generic),
        handles: SurfaceHandles {
            channel_id: row.get(3)?,
            thread_id: row.get(4)?,
            external_user_id: row.get(5)?,
            workspace_id: row.get(6)?,
        },
        current_agent_id: row.get(7)?,
        runtime_handle: row.get(8)?,
        status: status.parse().unwrap_or(SessionStatus::Error),
        context: serde_json::from_str(&context).unwrap_or_default(),
        integration_metadata: serde_json::from_str(&integration_metadata).unwrap_or_default(),
        user_context: serde_json::from_str(&user_context).unwrap_or_default(),
        request_count: row.get(13)?,
        created_at: parse_ts(&created_at).unwrap_or_default(),
        updated_at: parse_ts(&updated_at).unwrap_or_default(),
        last_activity_at: parse_ts(&last_activity_at).unwrap_or_default(),
    })
}

impl Store {
    /// Reuse the most recent active session for `(user, surface,
    /// channel?, thread?)` within the idle TTL, or create a new one.
    /// Atomic; returns `(session, created)`.
    pub fn get_or_create_session(
        &self,
        user_id: &str,
        surface: SurfaceKind,
        handles: &SurfaceHandles,
        idle_ttl: Duration,
    ) -> Result<(Session, bool)> {
        let now = Utc::now();
        let cutoff = now - idle_ttl;

        self.with_tx(|tx| {
            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions \
                         WHERE user_id = ?1 AND surface = ?2 \
                           AND channel_id IS ?3 AND thread_id IS ?4 \
                           AND status = 'active' AND last_activity_at >= ?5 \
                         ORDER BY last_activity_at DESC LIMIT 1"
                    ),
                    params![
                        user_id,
                        surface.as_str(),
                        handles.channel_id,
                        handles.thread_id,
                        ts(cutoff)
                    ],
                    session_from_row,
                )
                .optional()
                .map_err(sql_err)?;

            if let Some(session) = existing {
                tx.execute(
                    "UPDATE sessions SET last_activity_at = ?1, updated_at = ?1 WHERE id = ?2",
                    params![ts(now), session.id.to_string()],
                )
                .map_err(sql_err)?;
                return Ok((session, false));
            }

            let session = Session {
                id: Uuid::new_v4(),
                user_id: user_id.to_owned(),
                surface,
                handles: handles.clone(),
                current_agent_id: None,
                runtime_handle: None,
                status: SessionStatus::Active,
                context: serde_json::json!({}),
                integration_metadata: serde_json::json!({}),
                user_context: serde_json::json!({}),
                request_count: 0,
                created_at: now,
                updated_at: now,
                last_activity_at: now,
            };

            tx.execute(
                "INSERT INTO sessions (id, user_id, surface, channel_id, thread_id, \
                 external_user_id, workspace_id, status, context, integration_metadata, \
                 user_context, request_count, in_flight, created_at, updated_at, last_activity_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', '{}', '{}', '{}', 0, 0, ?8, ?8, ?8)",
                params![
                    session.id.to_string(),
                    user_id,
                    surface.as_str(),
                    handles.channel_id,
                    handles.thread_id,
                    handles.external_user_id,
                    handles.workspace_id,
                    ts(now)
                ],
            )
            .map_err(sql_err)?;

            tracing::info!(
                session_id = %session.id,
                user_id,
                surface = %surface,
                "session created"
            );

            Ok((session, true))
        })
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id.to_string()],
                session_from_row,
            )
            .optional()
            .map_err(sql_err)
        })
    }

    /// Acquire the session turn lock. The session row carries the
    /// lock: a conditional update flips `in_flight` only when no turn
    /// is running. A second caller gets `conflict`.
    pub fn acquire_turn(&self, session_id: Uuid) -> Result<TurnToken> {
        let token = Uuid::new_v4();
        let now = ts(Utc::now());

        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions \
                     SET in_flight = 1, turn_token = ?1, last_activity_at = ?2, updated_at = ?2 \
                     WHERE id = ?3 AND in_flight = 0",
                    params![token.to_string(), now, session_id.to_string()],
                )
                .map_err(sql_err)?;

            if changed == 1 {
                return Ok(TurnToken { session_id, token });
            }

            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    params![session_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;

            match exists {
                Some(_) => Err(Error::Conflict(format!(
                    "a turn is already in flight for session {session_id}"
                ))),
                None => Err(Error::Store(format!("session {session_id} not found"))),
            }
        })
    }

    /// Release the turn lock. Only the token holder may release; a
    /// mismatched token leaves the lock untouched.
    pub fn release_turn(&self, token: &TurnToken) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions SET in_flight = 0, turn_token = NULL, updated_at = ?1 \
                     WHERE id = ?2 AND turn_token = ?3",
                    params![
                        ts(Utc::now()),
                        token.session_id.to_string(),
                        token.token.to_string()
                    ],
                )
                .map_err(sql_err)?;

            if changed == 0 {
                return Err(Error::Conflict(format!(
                    "turn lock for session {} is not held by this token",
                    token.session_id
                )));
            }
            Ok(())
        })
    }

    pub fn set_current_agent(&self, session_id: Uuid, agent_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET current_agent_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![agent_id, ts(Utc::now()), session_id.to_string()],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    pub fn set_runtime_handle(&self, session_id: Uuid, handle: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET runtime_handle = ?1, updated_at = ?2 WHERE id = ?3",
                params![handle, ts(Utc::now()), session_id.to_string()],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    /// Merge a delta into the session context bag. Last-writer-wins at
    /// top-level field granularity; `null` values delete the field.
    pub fn update_session_context(
        &self,
        session_id: Uuid,
        delta: &serde_json::Value,
        max_bytes: usize,
    ) -> Result<()> {
        let delta_map = match delta.as_object() {
            Some(map) => map.clone(),
            None => {
                return Err(Error::BadRequest("context delta must be a JSON object".into()))
            }
        };

        self.with_tx(|tx| {
            let raw: Option<String> = tx
                .query_row(
                    "SELECT context FROM sessions WHERE id = ?1",
                    params![session_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;

            let raw = raw.ok_or_else(|| Error::Store(format!("session {session_id} not found")))?;
            let mut context: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&raw).unwrap_or_default();

            for (key, value) in delta_map {
                if value.is_null() {
                    context.remove(&key);
                } else {
                    context.insert(key, value);
                }
            }

            let merged = serde_json::to_string(&context)?;
            if merged.len() > max_bytes {
                return Err(Error::BadRequest(format!(
                    "session context exceeds {max_bytes} bytes"
                )));
            }

            tx.execute(
                "UPDATE sessions SET context = ?1, updated_at = ?2 WHERE id = ?3",
                params![merged, ts(Utc::now()), session_id.to_string()],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    /// Reclaim turn locks whose holder died mid-turn. `last_activity_at`
    /// is bumped on acquire, so a lock older than the stale bound has
    /// no live turn behind it.
    pub fn release_stale_turns(&self, older_than: Duration) -> Result<usize> {
        let cutoff = ts(Utc::now() - older_than);
        self.with_conn(|conn| {
            let released = conn
                .execute(
                    "UPDATE sessions SET in_flight = 0, turn_token = NULL \
                     WHERE in_flight = 1 AND last_activity_at < ?1",
                    params![cutoff],
                )
                .map_err(sql_err)?;
            if released > 0 {
                tracing::warn!(released, "reclaimed stale turn locks");
            }
            Ok(released)
        })
    }

    /// Idle lifecycle sweep: active sessions past the idle TTL become
    /// `inactive`; anything idle past the retention bound is closed.
    /// Sessions with a turn in flight are left alone.
    pub fn sweep_idle(&self, idle_ttl: Duration, retention: Duration) -> Result<(usize, usize)> {
        let now = Utc::now();
        let idle_cutoff = ts(now - idle_ttl);
        let retention_cutoff = ts(now - retention);

        self.with_tx(|tx| {
            let inactive = tx
                .execute(
                    "UPDATE sessions SET status = 'inactive', updated_at = ?1 \
                     WHERE status = 'active' AND in_flight = 0 AND last_activity_at < ?2",
                    params![ts(now), idle_cutoff],
                )
                .map_err(sql_err)?;

            let closed = tx
                .execute(
                    "UPDATE sessions SET status = 'completed', updated_at = ?1 \
                     WHERE status IN ('active', 'inactive') AND in_flight = 0 \
                       AND last_activity_at < ?2",
                    params![ts(now), retention_cutoff],
                )
                .map_err(sql_err)?;

            Ok((inactive, closed))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory(Vec::new()).unwrap()
    }

    fn handles() -> SurfaceHandles {
        SurfaceHandles::default()
    }

    #[test]
    fn create_then_reuse_session() {
        let store = store();
        let (first, created) = store
            .get_or_create_session("alice", SurfaceKind::Web, &handles(), Duration::minutes(30))
            .unwrap();
        assert!(created);

        let (second, created) = store
            .get_or_create_session("alice", SurfaceKind::Web, &handles(), Duration::minutes(30))
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn different_surfaces_get_different_sessions() {
        let store = store();
        let (web, _) = store
            .get_or_create_session("alice", SurfaceKind::Web, &handles(), Duration::minutes(30))
            .unwrap();
        let (cli, _) = store
            .get_or_create_session("alice", SurfaceKind::Cli, &handles(), Duration::minutes(30))
            .unwrap();
        assert_ne!(web.id, cli.id);
    }

    #[test]
    fn channel_scoping_separates_sessions() {
        let store = store();
        let mut with_channel = handles();
        with_channel.channel_id = Some("C1".into());
        let (a, _) = store
            .get_or_create_session("bob", SurfaceKind::Chat, &with_channel, Duration::minutes(30))
            .unwrap();
        let mut other_channel = handles();
        other_channel.channel_id = Some("C2".into());
        let (b, _) = store
            .get_or_create_session("bob", SurfaceKind::Chat, &other_channel, Duration::minutes(30))
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn turn_lock_rejects_second_acquirer() {
        let store = store();
        let (session, _) = store
            .get_or_create_session("alice", SurfaceKind::Web, &handles(), Duration::minutes(30))
            .unwrap();

        let token = store.acquire_turn(session.id).unwrap();
        let err = store.acquire_turn(session.id).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        store.release_turn(&token).unwrap();
        let token2 = store.acquire_turn(session.id).unwrap();
        store.release_turn(&token2).unwrap();
    }

    #[test]
    fn release_requires_matching_token() {
        let store = store();
        let (session, _) = store
            .get_or_create_session("alice", SurfaceKind::Web, &handles(), Duration::minutes(30))
            .unwrap();

        let token = store.acquire_turn(session.id).unwrap();
        let forged = TurnToken {
            session_id: session.id,
            token: Uuid::new_v4(),
        };
        assert!(store.release_turn(&forged).is_err());
        store.release_turn(&token).unwrap();
    }

    #[test]
    fn context_merge_is_field_granular() {
        let store = store();
        let (session, _) = store
            .get_or_create_session("alice", SurfaceKind::Web, &handles(), Duration::minutes(30))
            .unwrap();

        store
            .update_session_context(
                session.id,
                &serde_json::json!({"topic": "laptops", "step": 1}),
                32 * 1024,
            )
            .unwrap();
        store
            .update_session_context(
                session.id,
                &serde_json::json!({"step": 2, "topic": serde_json::Value::Null}),
                32 * 1024,
            )
            .unwrap();

        let session = store.get_session(session.id).unwrap().unwrap();
        assert_eq!(session.context["step"], 2);
        assert!(session.context.get("topic").is_none());
    }

    #[test]
    fn oversized_context_rejected() {
        let store = store();
        let (session, _) = store
            .get_or_create_session("alice", SurfaceKind::Web, &handles(), Duration::minutes(30))
            .unwrap();
        let err = store
            .update_session_context(
                session.id,
                &serde_json::json!({"blob": "x".repeat(64)}),
                32,
            )
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn sweep_marks_idle_sessions_inactive() {
        let store = store();
        let (session, _) = store
            .get_or_create_session("alice", SurfaceKind::Web, &handles(), Duration::minutes(30))
            .unwrap();

        // Sweep with a zero TTL: everything is idle.
        let (inactive, _) = store
            .sweep_idle(Duration::seconds(-1), Duration::hours(72))
            .unwrap();
        assert_eq!(inactive, 1);

        let session = store.get_session(session.id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Inactive);
    }

    #[test]
    fn stale_turn_locks_are_reclaimed() {
        let store = store();
        let (session, _) = store
            .get_or_create_session("alice", SurfaceKind::Web, &handles(), Duration::minutes(30))
            .unwrap();
        let _token = store.acquire_turn(session.id).unwrap();

        // A fresh lock is not stale.
        assert_eq!(store.release_stale_turns(Duration::minutes(5)).unwrap(), 0);
        // With a negative bound everything held counts as stale.
        assert_eq!(store.release_stale_turns(Duration::seconds(-1)).unwrap(), 1);

        // The lock is free again.
        let token = store.acquire_turn(session.id).unwrap();
        store.release_turn(&token).unwrap();
    }

    #[test]
    fn sweep_skips_in_flight_sessions() {
        let store = store();
        let (session, _) = store
            .get_or_create_session("alice", SurfaceKind::Web, &handles(), Duration::minutes(30))
            .unwrap();
        let _token = store.acquire_turn(session.id).unwrap();

        let (inactive, closed) = store
            .sweep_idle(Duration::seconds(-1), Duration::seconds(-1))
            .unwrap();
        assert_eq!(inactive, 0);
        assert_eq!(closed, 0);
    }
}
