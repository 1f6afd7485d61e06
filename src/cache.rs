//! Cache repository: local projections of foreign-service entities.
//!
//! Each service keeps a read-only cache of the entities the other service
//! owns, written exclusively by the event-dispatch path. The cache is a
//! derived, disposable artifact: replaying the event history from an empty
//! store reconstructs it.
//!
//! [`ForeignCache::upsert`] is an atomic insert-or-overwrite keyed by id
//! (a single keyed write, never read-then-branch), which is what makes
//! duplicate delivery harmless. There is no version or sequence comparison:
//! last delivered wins. Events for one entity are ordered within their
//! partition, so this only matters if updates for the same id ever span
//! partitions; that staleness window is accepted, not silently repaired.

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from a cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A row cached from the other service.
pub trait CacheEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Key namespace, e.g. `"books"` gives cache keys `books:42`
    const NAMESPACE: &'static str;

    /// Canonical id, in the owning service's id space
    fn id(&self) -> i64;
}

/// Port for the foreign-entity cache.
#[async_trait]
pub trait ForeignCache<E: CacheEntity>: Send + Sync {
    /// Insert or unconditionally overwrite the row for the entity's id.
    async fn upsert(&self, entity: E) -> Result<(), CacheError>;

    /// Delete the row if present. Removing an absent id succeeds, which is
    /// what lets replays and delete-before-create sequences pass through.
    async fn remove(&self, id: i64) -> Result<(), CacheError>;

    async fn get(&self, id: i64) -> Result<Option<E>, CacheError>;
}

/// Port for relationship link records, keyed by (owning id, foreign id).
///
/// `link` must succeed even when the foreign entity has no cache row yet;
/// the entity's own event will arrive and backfill it.
#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn link(&self, owner_id: i64, foreign_id: i64) -> Result<(), CacheError>;

    /// Remove one pair; an absent pair is a success. Returns whether the
    /// pair existed, so owning-side callers can decide to publish.
    async fn unlink(&self, owner_id: i64, foreign_id: i64) -> Result<bool, CacheError>;

    /// Remove every pair referencing `foreign_id`, for when the foreign
    /// entity is deleted upstream.
    async fn unlink_foreign(&self, foreign_id: i64) -> Result<(), CacheError>;

    async fn links_for(&self, owner_id: i64) -> Result<Vec<i64>, CacheError>;
}

/// In-process cache used by tests and the in-memory wiring.
pub struct MemoryCache<E: CacheEntity> {
    rows: RwLock<HashMap<i64, E>>,
}

impl<E: CacheEntity> Default for MemoryCache<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: CacheEntity> MemoryCache<E> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl<E: CacheEntity> ForeignCache<E> for MemoryCache<E> {
    async fn upsert(&self, entity: E) -> Result<(), CacheError> {
        self.rows.write().await.insert(entity.id(), entity);
        Ok(())
    }

    async fn remove(&self, id: i64) -> Result<(), CacheError> {
        self.rows.write().await.remove(&id);
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<E>, CacheError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }
}

/// In-process link store.
#[derive(Default)]
pub struct MemoryLinkStore {
    pairs: RwLock<HashSet<(i64, i64)>>,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LinkStore for MemoryLinkStore {
    async fn link(&self, owner_id: i64, foreign_id: i64) -> Result<(), CacheError> {
        self.pairs.write().await.insert((owner_id, foreign_id));
        Ok(())
    }

    async fn unlink(&self, owner_id: i64, foreign_id: i64) -> Result<bool, CacheError> {
        Ok(self.pairs.write().await.remove(&(owner_id, foreign_id)))
    }

    async fn unlink_foreign(&self, foreign_id: i64) -> Result<(), CacheError> {
        self.pairs
            .write()
            .await
            .retain(|(_, foreign)| *foreign != foreign_id);
        Ok(())
    }

    async fn links_for(&self, owner_id: i64) -> Result<Vec<i64>, CacheError> {
        let mut linked: Vec<i64> = self
            .pairs
            .read()
            .await
            .iter()
            .filter(|(owner, _)| *owner == owner_id)
            .map(|(_, foreign)| *foreign)
            .collect();
        linked.sort_unstable();
        Ok(linked)
    }
}

/// Production cache on Redis: one JSON value per entity under
/// `<namespace>:<id>`, written with a plain `SET` so the upsert is a single
/// atomic keyed write.
pub struct RedisCache<E: CacheEntity> {
    pool: Pool,
    _entity: PhantomData<E>,
}

impl<E: CacheEntity> RedisCache<E> {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            _entity: PhantomData,
        }
    }

    fn key(id: i64) -> String {
        format!("{}:{}", E::NAMESPACE, id)
    }
}

#[async_trait]
impl<E: CacheEntity> ForeignCache<E> for RedisCache<E> {
    async fn upsert(&self, entity: E) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let json = serde_json::to_string(&entity)?;
        let _: () = cmd("SET")
            .arg(Self::key(entity.id()))
            .arg(json)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, id: i64) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let _: () = cmd("DEL")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<E>, CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let json: Option<String> = cmd("GET")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// Production link store on Redis sets, with a reverse index per foreign id
/// so deleting a foreign entity can purge all of its links.
pub struct RedisLinkStore {
    pool: Pool,
    namespace: String,
}

impl RedisLinkStore {
    pub fn new(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    fn owner_key(&self, owner_id: i64) -> String {
        format!("{}:owner:{}", self.namespace, owner_id)
    }

    fn foreign_key(&self, foreign_id: i64) -> String {
        format!("{}:foreign:{}", self.namespace, foreign_id)
    }
}

#[async_trait]
impl LinkStore for RedisLinkStore {
    async fn link(&self, owner_id: i64, foreign_id: i64) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let _: () = cmd("SADD")
            .arg(self.owner_key(owner_id))
            .arg(foreign_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let _: () = cmd("SADD")
            .arg(self.foreign_key(foreign_id))
            .arg(owner_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn unlink(&self, owner_id: i64, foreign_id: i64) -> Result<bool, CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let removed: i64 = cmd("SREM")
            .arg(self.owner_key(owner_id))
            .arg(foreign_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let _: () = cmd("SREM")
            .arg(self.foreign_key(foreign_id))
            .arg(owner_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        Ok(removed > 0)
    }

    async fn unlink_foreign(&self, foreign_id: i64) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let owners: Vec<i64> = cmd("SMEMBERS")
            .arg(self.foreign_key(foreign_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        for owner_id in owners {
            let _: () = cmd("SREM")
                .arg(self.owner_key(owner_id))
                .arg(foreign_id)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
        }

        let _: () = cmd("DEL")
            .arg(self.foreign_key(foreign_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn links_for(&self, owner_id: i64) -> Result<Vec<i64>, CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let mut linked: Vec<i64> = cmd("SMEMBERS")
            .arg(self.owner_key(owner_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        linked.sort_unstable();
        Ok(linked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: i64,
        name: String,
    }

    impl CacheEntity for Row {
        const NAMESPACE: &'static str = "rows";

        fn id(&self) -> i64 {
            self.id
        }
    }

    fn row(id: i64, name: &str) -> Row {
        Row {
            id,
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let cache = MemoryCache::new();

        for _ in 0..5 {
            cache.upsert(row(1, "X")).await.unwrap();
        }

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(1).await.unwrap(), Some(row(1, "X")));
    }

    #[tokio::test]
    async fn test_upsert_overwrites_unconditionally() {
        let cache = MemoryCache::new();
        cache.upsert(row(1, "X")).await.unwrap();
        cache.upsert(row(1, "Y")).await.unwrap();

        assert_eq!(cache.get(1).await.unwrap(), Some(row(1, "Y")));
    }

    #[tokio::test]
    async fn test_remove_absent_id_succeeds() {
        let cache: MemoryCache<Row> = MemoryCache::new();
        cache.remove(99).await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_link_without_cached_foreign_entity_succeeds() {
        let links = MemoryLinkStore::new();
        links.link(1, 42).await.unwrap();

        assert_eq!(links.links_for(1).await.unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_link_is_idempotent() {
        let links = MemoryLinkStore::new();
        links.link(1, 42).await.unwrap();
        links.link(1, 42).await.unwrap();

        assert_eq!(links.links_for(1).await.unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_unlink_absent_pair_succeeds() {
        let links = MemoryLinkStore::new();
        assert!(!links.unlink(1, 42).await.unwrap());
        assert!(links.links_for(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlink_reports_existing_pair() {
        let links = MemoryLinkStore::new();
        links.link(1, 42).await.unwrap();
        assert!(links.unlink(1, 42).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlink_foreign_purges_every_owner() {
        let links = MemoryLinkStore::new();
        links.link(1, 42).await.unwrap();
        links.link(2, 42).await.unwrap();
        links.link(2, 7).await.unwrap();

        links.unlink_foreign(42).await.unwrap();

        assert!(links.links_for(1).await.unwrap().is_empty());
        assert_eq!(links.links_for(2).await.unwrap(), vec![7]);
    }
}
