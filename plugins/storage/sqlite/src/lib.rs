use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use scanstate_api::{
    EntityKey, Observation, ObservationRecord, Page, StateStore, StoreError, StoreFuture,
    StoreKind,
};

const SQL_SCHEMA: &str = include_str!("../sql/schema.sql");
const SQL_UPSERT: &str = include_str!("../sql/upsert.sql");

const SQL_GET: &str = "SELECT ip, port, service, last_timestamp, response, updated_at \
     FROM service_records WHERE ip = ?1 AND port = ?2 AND service = ?3";

// LIMIT -1 is unbounded in SQLite.
const SQL_LIST: &str = "SELECT ip, port, service, last_timestamp, response, updated_at \
     FROM service_records \
     ORDER BY last_timestamp DESC, ip ASC, port ASC, service ASC \
     LIMIT ?1 OFFSET ?2";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ═══════════════════════════════════════════════════════════════
//  SqliteStore
// ═══════════════════════════════════════════════════════════════

/// Embedded SQL store.
///
/// `upsert` is one `INSERT … ON CONFLICT DO UPDATE … WHERE` statement, so
/// the timestamp guard is evaluated by SQLite inside the write itself. This
/// also holds across processes sharing the same database file.
///
/// rusqlite is blocking: every call runs on the tokio blocking pool with
/// exclusive access to the connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
    path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. Parent directories are
    /// created; `:memory:` opens a private in-memory database.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        if path != ":memory:" {
            if let Some(dir) = Path::new(path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)
                        .map_err(|e| StoreError::Config(format!("create directory {}: {e}", dir.display())))?;
                }
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| map_sqlite_error(e).with_context(format!("open '{path}'")))?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqlite_error)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| map_sqlite_error(e).with_context("enable WAL"))?;
        conn.execute_batch(SQL_SCHEMA)
            .map_err(|e| map_sqlite_error(e).with_context("create schema"))?;

        tracing::info!(path = %path, journal_mode = %mode, "sqlite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Connection("connection mutex poisoned".into()))?;
            match guard.as_ref() {
                Some(c) => f(c),
                None => Err(StoreError::Closed),
            }
        })
        .await
        .map_err(|e| StoreError::Connection(format!("{op}: blocking task failed: {e}")))?
        .map_err(|e| e.with_context(op))
    }
}

impl StateStore for SqliteStore {
    fn upsert<'a>(&'a self, observation: &'a Observation) -> StoreFuture<'a, bool> {
        let obs = observation.clone();
        Box::pin(self.with_conn("upsert", move |conn| {
            let changed = conn
                .execute(
                    SQL_UPSERT,
                    params![
                        obs.key.ip(),
                        obs.key.port(),
                        obs.key.service(),
                        obs.event_timestamp,
                        obs.payload,
                    ],
                )
                .map_err(map_sqlite_error)?;
            Ok(changed > 0)
        }))
    }

    fn get<'a>(&'a self, key: &'a EntityKey) -> StoreFuture<'a, Option<ObservationRecord>> {
        let key = key.clone();
        Box::pin(self.with_conn("get", move |conn| {
            conn.query_row(SQL_GET, params![key.ip(), key.port(), key.service()], map_row)
                .optional()
                .map_err(map_sqlite_error)
        }))
    }

    fn list(&self, page: Page) -> StoreFuture<'_, Vec<ObservationRecord>> {
        let limit = page.sql_limit().unwrap_or(-1);
        let offset = page.sql_offset();
        Box::pin(self.with_conn("list", move |conn| {
            let mut stmt = conn.prepare_cached(SQL_LIST).map_err(map_sqlite_error)?;
            let rows = stmt
                .query_map(params![limit, offset], map_row)
                .map_err(map_sqlite_error)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite_error)
        }))
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        let conn = self.conn.clone();
        let path = self.path.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = conn
                    .lock()
                    .map_err(|_| StoreError::Connection("connection mutex poisoned".into()))?;
                if let Some(c) = guard.take() {
                    c.close().map_err(|(_, e)| map_sqlite_error(e).with_context("close"))?;
                    tracing::info!(path = %path, "sqlite store closed");
                }
                Ok(())
            })
            .await
            .map_err(|e| StoreError::Connection(format!("close: blocking task failed: {e}")))?
        })
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Sqlite
    }
}

// ---------------------------------------------------------------------------
// Row mapping / error mapping
// ---------------------------------------------------------------------------

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ObservationRecord> {
    let port: i64 = row.get(1)?;
    let port = u32::try_from(port).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Integer, Box::new(e))
    })?;
    let updated_at: chrono::NaiveDateTime = row.get(5)?;
    Ok(ObservationRecord {
        key: EntityKey::new(row.get::<_, String>(0)?, port, row.get::<_, String>(2)?),
        event_timestamp: row.get(3)?,
        payload: row.get(4)?,
        ingested_at: updated_at.and_utc(),
    })
}

fn map_sqlite_error(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig => {
                StoreError::Constraint(e.to_string())
            }
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::ReadOnly => StoreError::Connection(e.to_string()),
            _ => StoreError::Query(e.to_string()),
        },
        _ => StoreError::Query(e.to_string()),
    }
}
