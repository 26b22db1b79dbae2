//! Table definitions and the schema-version gate.

use rusqlite::Connection;

use selfserve_domain::{Error, Result};

use crate::sql_err;

/// Expected `PRAGMA user_version`. Bumped by out-of-band migrations;
/// the runtime only ever asserts it.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize a fresh database, or assert the version of an existing
/// one. A mismatch is a hard error — we never migrate at runtime.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(sql_err)?;

    if version == 0 {
        create_tables(conn)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(sql_err)?;
        return Ok(());
    }

    if version != SCHEMA_VERSION {
        return Err(Error::Store(format!(
            "schema version mismatch: database is at {version}, expected {SCHEMA_VERSION} — \
             apply migrations before starting"
        )));
    }

    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            surface TEXT NOT NULL,
            channel_id TEXT,
            thread_id TEXT,
            external_user_id TEXT,
            workspace_id TEXT,
            current_agent_id TEXT,
            runtime_handle TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            context TEXT NOT NULL DEFAULT '{}',
            integration_metadata TEXT NOT NULL DEFAULT '{}',
            user_context TEXT NOT NULL DEFAULT '{}',
            request_count INTEGER NOT NULL DEFAULT 0,
            in_flight INTEGER NOT NULL DEFAULT 0,
            turn_token TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_lookup
            ON sessions (user_id, surface, channel_id, thread_id, status, last_activity_at);

        CREATE TABLE IF NOT EXISTS request_logs (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions (id),
            request TEXT NOT NULL,
            response TEXT,
            agent_id TEXT,
            processing_ms INTEGER,
            event_id TEXT,
            event_type TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_request_logs_session
            ON request_logs (session_id, created_at);

        CREATE TABLE IF NOT EXISTS user_integration_configs (
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            config TEXT NOT NULL DEFAULT '{}',
            priority INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 3,
            retry_delay_seconds INTEGER NOT NULL DEFAULT 30,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, kind)
        );

        CREATE TABLE IF NOT EXISTS delivery_logs (
            request_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            error TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            PRIMARY KEY (request_id, kind, attempt)
        );

        CREATE TABLE IF NOT EXISTS event_claims (
            event_id TEXT PRIMARY KEY,
            claimed_by TEXT NOT NULL,
            claimed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_deliveries (
            request_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            user_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            next_attempt_at TEXT NOT NULL,
            PRIMARY KEY (request_id, kind)
        );

        CREATE INDEX IF NOT EXISTS idx_pending_deliveries_due
            ON pending_deliveries (next_attempt_at);
        "#,
    )
    .map_err(sql_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_gets_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn version_mismatch_refuses_to_start() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        let err = ensure_schema(&conn).unwrap_err();
        assert!(err.to_string().contains("schema version mismatch"));
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();
    }
}
