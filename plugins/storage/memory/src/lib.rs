use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;

use scanstate_api::{
    list_order, EntityKey, Observation, ObservationRecord, Page, StateStore, StoreError,
    StoreFuture, StoreKind,
};

pub const DEFAULT_SHARDS: usize = 16;

// ═══════════════════════════════════════════════════════════════
//  MemoryStore
// ═══════════════════════════════════════════════════════════════

/// In-process store. Keys are hashed into shards; each shard has its own
/// lock, and the compare-and-write of `upsert` runs entirely under the
/// shard's write lock. Writes to keys in different shards never contend.
///
/// State lives only as long as the process.
pub struct MemoryStore {
    shards: Vec<RwLock<HashMap<EntityKey, ObservationRecord>>>,
    hasher: RandomState,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl MemoryStore {
    /// `shards` is clamped to at least 1.
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn shard(&self, key: &EntityKey) -> &RwLock<HashMap<EntityKey, ObservationRecord>> {
        let idx = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl StateStore for MemoryStore {
    fn upsert<'a>(&'a self, observation: &'a Observation) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut shard = self.shard(&observation.key).write().await;
            let newer = match shard.get(&observation.key) {
                Some(existing) => observation.event_timestamp > existing.event_timestamp,
                None => true,
            };
            if !newer {
                return Ok(false);
            }
            shard.insert(
                observation.key.clone(),
                observation.clone().into_record(Utc::now()),
            );
            Ok(true)
        })
    }

    fn get<'a>(&'a self, key: &'a EntityKey) -> StoreFuture<'a, Option<ObservationRecord>> {
        Box::pin(async move {
            self.ensure_open()?;
            Ok(self.shard(key).read().await.get(key).cloned())
        })
    }

    fn list(&self, page: Page) -> StoreFuture<'_, Vec<ObservationRecord>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut all = Vec::new();
            for shard in &self.shards {
                all.extend(shard.read().await.values().cloned());
            }
            all.sort_by(list_order);
            Ok(page.apply(all))
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            Ok(())
        })
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }
}
