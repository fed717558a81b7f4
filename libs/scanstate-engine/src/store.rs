use std::sync::Arc;

use serde::{Deserialize, Serialize};

use scanstate_api::{StateStore, StoreError, StoreKind};
use scanstate_storage_memory::{DEFAULT_SHARDS, MemoryStore};
use scanstate_storage_postgres::PostgresStore;
use scanstate_storage_sqlite::SqliteStore;

/// `[store]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_kind")]
    pub kind: StoreKind,
    /// SQLite file path or Postgres connection string. Ignored by `memory`.
    #[serde(default = "default_connection")]
    pub connection: String,
    /// Lock shards of the memory store.
    #[serde(default = "default_shards")]
    pub shards: usize,
}

fn default_kind() -> StoreKind {
    StoreKind::Sqlite
}
fn default_connection() -> String {
    "/data/scans.db".into()
}
fn default_shards() -> usize {
    DEFAULT_SHARDS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { kind: default_kind(), connection: default_connection(), shards: default_shards() }
    }
}

/// Open the backend selected by `config.kind`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn StateStore>, StoreError> {
    let store: Arc<dyn StateStore> = match config.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new(config.shards)),
        StoreKind::Sqlite => {
            if config.connection.is_empty() {
                return Err(StoreError::Config("sqlite store needs a file path".into()));
            }
            let path = config.connection.clone();
            let store = tokio::task::spawn_blocking(move || SqliteStore::open(&path))
                .await
                .map_err(|e| StoreError::Connection(format!("open task: {e}")))??;
            Arc::new(store)
        }
        StoreKind::Postgres => {
            if config.connection.is_empty() {
                return Err(StoreError::Config("postgres store needs a connection string".into()));
            }
            Arc::new(PostgresStore::connect(&config.connection).await?)
        }
    };
    tracing::info!(store = %config.kind, "state store opened");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_memory() {
        let cfg = StoreConfig { kind: StoreKind::Memory, connection: String::new(), shards: 2 };
        let store = open_store(&cfg).await.unwrap();
        assert_eq!(store.kind(), StoreKind::Memory);
    }

    #[tokio::test]
    async fn opens_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scans.db");
        let cfg = StoreConfig {
            kind: StoreKind::Sqlite,
            connection: path.to_string_lossy().into_owned(),
            shards: 1,
        };
        let store = open_store(&cfg).await.unwrap();
        assert_eq!(store.kind(), StoreKind::Sqlite);
        assert!(path.exists());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn empty_connection_rejected() {
        for kind in [StoreKind::Sqlite, StoreKind::Postgres] {
            let cfg = StoreConfig { kind, connection: String::new(), shards: 1 };
            assert!(matches!(open_store(&cfg).await, Err(StoreError::Config(_))));
        }
    }
}
