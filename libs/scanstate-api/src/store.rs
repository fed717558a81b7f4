use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{EntityKey, Observation, ObservationRecord};

/// Boxed future returned by every [`StateStore`] method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

// ═══════════════════════════════════════════════════════════════
//  StoreKind
// ═══════════════════════════════════════════════════════════════

/// Which backend holds the state. Chosen once at startup from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    Sqlite,
    Postgres,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Sqlite => "sqlite",
            StoreKind::Postgres => "postgres",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StoreKind::Memory),
            "sqlite" => Ok(StoreKind::Sqlite),
            "postgres" | "postgresql" => Ok(StoreKind::Postgres),
            other => Err(StoreError::Config(format!("unknown store type: '{other}'"))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Page
// ═══════════════════════════════════════════════════════════════

/// Pagination window for [`StateStore::list`]. `limit == 0` is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    /// Every record, no offset.
    pub fn all() -> Self {
        Self::default()
    }

    /// Apply the window to an already ordered list.
    pub fn apply<T>(&self, mut items: Vec<T>) -> Vec<T> {
        if self.offset >= items.len() {
            return Vec::new();
        }
        let mut items = items.split_off(self.offset);
        if self.limit > 0 {
            items.truncate(self.limit);
        }
        items
    }

    /// `LIMIT` bound for SQL backends: `None` when unbounded, saturated at
    /// `i64::MAX`.
    pub fn sql_limit(&self) -> Option<i64> {
        (self.limit > 0).then(|| i64::try_from(self.limit).unwrap_or(i64::MAX))
    }

    /// `OFFSET` for SQL backends, saturated at `i64::MAX`.
    pub fn sql_offset(&self) -> i64 {
        i64::try_from(self.offset).unwrap_or(i64::MAX)
    }
}

// ═══════════════════════════════════════════════════════════════
//  StateStore
// ═══════════════════════════════════════════════════════════════

/// Latest-observation-per-key storage.
///
/// Every implementation shares one contract:
///
/// - `upsert` writes iff no record exists for the key or the incoming
///   `event_timestamp` is strictly greater than the stored one. Equal
///   timestamps keep the stored value. The comparison and the write are a
///   single atomic step with respect to every other `upsert`.
/// - `get` and `list` never resolve conflicts and never write.
/// - `list` orders by `event_timestamp` descending, then by key ascending.
/// - `close` is idempotent; any other call after it fails with
///   [`StoreError::Closed`].
pub trait StateStore: Send + Sync {
    /// Conditional insert-or-replace. Returns whether the write was applied.
    fn upsert<'a>(&'a self, observation: &'a Observation) -> StoreFuture<'a, bool>;

    /// Current record for `key`, `None` if no write was ever accepted.
    fn get<'a>(&'a self, key: &'a EntityKey) -> StoreFuture<'a, Option<ObservationRecord>>;

    /// Records ordered by `event_timestamp` descending, windowed by `page`.
    fn list(&self, page: Page) -> StoreFuture<'_, Vec<ObservationRecord>>;

    /// Release connections / files.
    fn close(&self) -> StoreFuture<'_, ()>;

    fn kind(&self) -> StoreKind;
}

/// Ordering shared by all backends for `list`: newest first, key as tie-break.
pub fn list_order(a: &ObservationRecord, b: &ObservationRecord) -> std::cmp::Ordering {
    b.event_timestamp
        .cmp(&a.event_timestamp)
        .then_with(|| a.key.cmp(&b.key))
}
