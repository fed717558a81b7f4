#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use tempfile::TempDir;

use scanstate_api::StateStore;
use scanstate_storage_memory::MemoryStore;
use scanstate_storage_postgres::PostgresStore;
use scanstate_storage_sqlite::SqliteStore;

pub const POSTGRES_URL_ENV: &str = "SCANSTATE_TEST_POSTGRES_URL";

/// A store under test. Holds the temp dir alive for file-backed stores.
pub struct Backend {
    pub name: &'static str,
    pub store: Arc<dyn StateStore>,
    /// Unique per backend instance; Postgres tables are shared between runs.
    pub scope: String,
    origin: Origin,
    _dir: Option<TempDir>,
}

/// Where a backend's state lives, so more handles can be opened on it.
enum Origin {
    Shared,
    File(PathBuf),
    Url(String),
}

impl Backend {
    /// Another handle on the same state: the same instance for memory, a
    /// separate connection for the SQL backends.
    pub async fn another_handle(&self) -> Arc<dyn StateStore> {
        match &self.origin {
            Origin::Shared => self.store.clone(),
            Origin::File(path) => Arc::new(SqliteStore::open(path.to_str().unwrap()).unwrap()),
            Origin::Url(url) => Arc::new(PostgresStore::connect(url).await.unwrap()),
        }
    }
}

fn unique_scope() -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    format!("{}-{nanos}", std::process::id())
}

/// Memory, SQLite on a temp file, and Postgres when configured.
pub async fn backends() -> Vec<Backend> {
    let mut out = vec![Backend {
        name: "memory",
        store: Arc::new(MemoryStore::default()),
        scope: unique_scope(),
        origin: Origin::Shared,
        _dir: None,
    }];

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scans.db");
    out.push(Backend {
        name: "sqlite",
        store: Arc::new(SqliteStore::open(path.to_str().unwrap()).unwrap()),
        scope: unique_scope(),
        origin: Origin::File(path),
        _dir: Some(dir),
    });

    if let Ok(url) = std::env::var(POSTGRES_URL_ENV) {
        out.push(Backend {
            name: "postgres",
            store: Arc::new(PostgresStore::connect(&url).await.unwrap()),
            scope: unique_scope(),
            origin: Origin::Url(url),
            _dir: None,
        });
    }
    out
}

/// Deterministic shuffle without pulling in an RNG crate.
pub fn shuffle<T>(items: &mut [T], mut seed: u64) {
    for i in (1..items.len()).rev() {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let j = (seed >> 33) as usize % (i + 1);
        items.swap(i, j);
    }
}

pub fn v2_envelope(ip: &str, port: u32, service: &str, ts: i64, payload: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ip": ip, "port": port, "service": service,
        "timestamp": ts, "data_version": 2,
        "data": {"response_str": payload},
    }))
    .unwrap()
}
