//! Session/Request Store — the durable state layer shared by all
//! three services.
//!
//! SQLite-backed. The session row doubles as the turn-lock carrier:
//! `acquire_turn` is a conditional update on `in_flight`, so at most
//! one request per session is ever in flight, with no external
//! coordinator. All multi-row mutations run in single transactions.

pub mod deliveries;
pub mod integrations;
pub mod requests;
pub mod schema;
pub mod sessions;

pub use deliveries::PendingDelivery;
pub use requests::DispatchClaim;
pub use sessions::TurnToken;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use selfserve_domain::{Error, IntegrationDefault, IntegrationKind, Result};

/// Durable store over SQLite. Cheap to share behind an `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
    defaults: HashMap<IntegrationKind, IntegrationDefault>,
}

impl Store {
    /// Open (or create) the store at `path` and assert the schema
    /// version. A version mismatch is a boot failure — migrations are
    /// applied out of band, never at runtime.
    pub fn open(
        path: &Path,
        busy_timeout_ms: u64,
        defaults: Vec<IntegrationDefault>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Store(format!("open {}: {e}", path.display())))?;
        Self::from_connection(conn, busy_timeout_ms, defaults)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(defaults: Vec<IntegrationDefault>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::from_connection(conn, 0, defaults)
    }

    fn from_connection(
        conn: Connection,
        busy_timeout_ms: u64,
        defaults: Vec<IntegrationDefault>,
    ) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").map_err(sql_err)?;
        if busy_timeout_ms > 0 {
            conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))
                .map_err(sql_err)?;
        }

        schema::ensure_schema(&conn)?;

        tracing::info!(
            schema_version = schema::SCHEMA_VERSION,
            defaults = defaults.len(),
            "store ready"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            defaults: defaults.into_iter().map(|d| (d.kind, d)).collect(),
        })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(sql_err)?;
        Ok(out)
    }

    pub(crate) fn default_for(&self, kind: IntegrationKind) -> Option<&IntegrationDefault> {
        self.defaults.get(&kind)
    }

    /// Liveness probe used by `/health/detailed`.
    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(())).map_err(sql_err)
        })
    }
}

pub(crate) fn sql_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("bad timestamp {raw}: {e}")))
}
