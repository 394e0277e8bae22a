//! The store trait and its in-memory implementation.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use lru::LruCache;

use super::entry::CachedEntry;
use super::generation::Generation;
use super::identity::RequestIdentity;
use super::StoreError;

/// Addressable response storage partitioned into named generations.
///
/// Implementations are shared across request tasks and must tolerate
/// concurrent writes to the same identity: the last completed write wins and
/// no reader ever sees a half-written entry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the entry stored for `identity` in `generation`, if any.
    async fn lookup(
        &self,
        generation: &Generation,
        identity: &RequestIdentity,
    ) -> Result<Option<CachedEntry>, StoreError>;

    /// Stores `entry`, replacing any previous entry for `identity`.
    /// The generation is created on first write.
    async fn write(
        &self,
        generation: &Generation,
        identity: &RequestIdentity,
        entry: CachedEntry,
    ) -> Result<(), StoreError>;

    /// Names of every generation currently holding data.
    async fn list_generations(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Removes a whole generation. Returns `false` if it did not exist.
    async fn delete_generation(&self, name: &str) -> Result<bool, StoreError>;

    fn name(&self) -> &'static str;
}

/// In-process store. Each generation is an LRU map bounded to `max_entries`.
pub struct MemoryStore {
    generations: RwLock<HashMap<String, LruCache<String, CachedEntry>>>,
    max_entries: NonZeroUsize,
}

impl MemoryStore {
    /// Creates a store whose generations each hold at most `max_entries`
    /// entries (clamped to at least one).
    pub fn new(max_entries: usize) -> Self {
        Self {
            generations: RwLock::new(HashMap::new()),
            max_entries: NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN),
        }
    }

    /// Number of entries held in `generation`.
    pub fn entry_count(&self, generation: &str) -> usize {
        self.generations
            .read()
            .map(|map| map.get(generation).map_or(0, LruCache::len))
            .unwrap_or(0)
    }

    fn locked(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<String, LruCache<String, CachedEntry>>>, StoreError>
    {
        self.generations
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn lookup(
        &self,
        generation: &Generation,
        identity: &RequestIdentity,
    ) -> Result<Option<CachedEntry>, StoreError> {
        // LRU promotion needs the write lock.
        let mut map = self.locked()?;
        Ok(map
            .get_mut(generation.as_str())
            .and_then(|entries| entries.get(&identity.digest()).cloned()))
    }

    async fn write(
        &self,
        generation: &Generation,
        identity: &RequestIdentity,
        entry: CachedEntry,
    ) -> Result<(), StoreError> {
        let mut map = self.locked()?;
        map.entry(generation.as_str().to_owned())
            .or_insert_with(|| LruCache::new(self.max_entries))
            .put(identity.digest(), entry);
        Ok(())
    }

    async fn list_generations(&self) -> Result<BTreeSet<String>, StoreError> {
        let map = self
            .generations
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(map.keys().cloned().collect())
    }

    async fn delete_generation(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.locked()?.remove(name).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
