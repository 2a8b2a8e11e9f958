//! Uniform storage interface with one adapter per back-end.
//!
//! The tier manager only ever talks to [`StorageAdapter`]; each adapter owns
//! the translation between `MemoryItem`s and its back-end's native contract.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use super::archive::ArchiveBackend;
use super::durable_store::DurableBackend;
use super::fast_cache::FastCacheBackend;
use super::vector_store::{DimensionMismatch, VectorBackend};
use super::{cosine_similarity, decode_item, encode_item, MemoryItem, Tier};
use crate::error::{StorageError, StorageResult};

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn tier(&self) -> Tier;

    async fn write(&self, item: &MemoryItem) -> StorageResult<()>;

    async fn read(&self, id: &str) -> StorageResult<Option<MemoryItem>>;

    async fn remove(&self, id: &str) -> StorageResult<()>;

    /// Ranked `(id, similarity)` pairs for tiers that can answer similarity queries.
    async fn similar(&self, _embedding: &[f32], _top_k: usize) -> StorageResult<Vec<(String, f32)>> {
        Err(StorageError::Unsupported {
            tier: self.tier(),
            operation: "similarity search",
        })
    }

    /// Every item held by the tier.
    async fn scan(&self) -> StorageResult<Vec<MemoryItem>> {
        Err(StorageError::Unsupported {
            tier: self.tier(),
            operation: "scan",
        })
    }
}

/// L0: bounded LRU map inside the process.
pub struct LocalAdapter {
    items: Mutex<LruCache<String, MemoryItem>>,
}

impl LocalAdapter {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            items: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.lock().contains(id)
    }
}

#[async_trait]
impl StorageAdapter for LocalAdapter {
    fn tier(&self) -> Tier {
        Tier::L0
    }

    async fn write(&self, item: &MemoryItem) -> StorageResult<()> {
        self.items.lock().put(item.id.clone(), item.clone());
        Ok(())
    }

    async fn read(&self, id: &str) -> StorageResult<Option<MemoryItem>> {
        Ok(self.items.lock().get(id).cloned())
    }

    async fn remove(&self, id: &str) -> StorageResult<()> {
        self.items.lock().pop(id);
        Ok(())
    }

    async fn similar(&self, embedding: &[f32], top_k: usize) -> StorageResult<Vec<(String, f32)>> {
        let items = self.items.lock();
        let mut ranked: Vec<(String, f32)> = items
            .iter()
            .filter_map(|(id, item)| {
                item.embedding
                    .as_ref()
                    .map(|e| (id.clone(), cosine_similarity(embedding, e)))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(top_k);
        Ok(ranked)
    }
}

/// L1: fast expiring cache; entries never outlive the item's own expiry.
pub struct CacheAdapter {
    backend: Arc<dyn FastCacheBackend>,
    ttl: Duration,
}

impl CacheAdapter {
    pub fn new(backend: Arc<dyn FastCacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }
}

#[async_trait]
impl StorageAdapter for CacheAdapter {
    fn tier(&self) -> Tier {
        Tier::L1
    }

    async fn write(&self, item: &MemoryItem) -> StorageResult<()> {
        let ttl = item
            .remaining_ttl(chrono::Utc::now())
            .map(|remaining| remaining.min(self.ttl))
            .unwrap_or(self.ttl);
        if ttl.is_zero() {
            return Ok(());
        }

        let bytes = encode_item(item)?;
        self.backend
            .set(&item.id, bytes, ttl)
            .await
            .map_err(|e| StorageError::unreachable(Tier::L1, e))
    }

    async fn read(&self, id: &str) -> StorageResult<Option<MemoryItem>> {
        let bytes = self
            .backend
            .get(id)
            .await
            .map_err(|e| StorageError::unreachable(Tier::L1, e))?;
        bytes.map(|b| decode_item(&b)).transpose()
    }

    async fn remove(&self, id: &str) -> StorageResult<()> {
        self.backend
            .delete(id)
            .await
            .map_err(|e| StorageError::unreachable(Tier::L1, e))
    }
}

/// L2: the authoritative durable copy.
pub struct DurableAdapter {
    backend: Arc<dyn DurableBackend>,
}

impl DurableAdapter {
    pub fn new(backend: Arc<dyn DurableBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl StorageAdapter for DurableAdapter {
    fn tier(&self) -> Tier {
        Tier::L2
    }

    async fn write(&self, item: &MemoryItem) -> StorageResult<()> {
        let bytes = encode_item(item)?;
        self.backend
            .put(&item.id, bytes)
            .await
            .map_err(|e| StorageError::unreachable(Tier::L2, e))
    }

    async fn read(&self, id: &str) -> StorageResult<Option<MemoryItem>> {
        let bytes = self
            .backend
            .get(id)
            .await
            .map_err(|e| StorageError::unreachable(Tier::L2, e))?;
        bytes.map(|b| decode_item(&b)).transpose()
    }

    async fn remove(&self, id: &str) -> StorageResult<()> {
        self.backend
            .delete(id)
            .await
            .map_err(|e| StorageError::unreachable(Tier::L2, e))
    }

    async fn scan(&self) -> StorageResult<Vec<MemoryItem>> {
        let entries = self
            .backend
            .scan()
            .await
            .map_err(|e| StorageError::unreachable(Tier::L2, e))?;
        entries.iter().map(|(_, bytes)| decode_item(bytes)).collect()
    }
}

/// Dimension mismatches are caller errors, not outages.
fn vector_error(e: anyhow::Error) -> StorageError {
    match e.downcast_ref::<DimensionMismatch>() {
        Some(mismatch) => StorageError::Invalid {
            tier: Tier::L3,
            reason: mismatch.to_string(),
        },
        None => StorageError::unreachable(Tier::L3, e),
    }
}

/// L3: vector index; only items carrying an embedding are indexed.
pub struct VectorAdapter {
    backend: Arc<dyn VectorBackend>,
}

impl VectorAdapter {
    pub fn new(backend: Arc<dyn VectorBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl StorageAdapter for VectorAdapter {
    fn tier(&self) -> Tier {
        Tier::L3
    }

    async fn write(&self, item: &MemoryItem) -> StorageResult<()> {
        let Some(embedding) = item.embedding.clone() else {
            return Ok(());
        };
        let payload = encode_item(item)?;
        self.backend
            .upsert(&item.id, embedding, payload)
            .await
            .map_err(vector_error)
    }

    async fn read(&self, id: &str) -> StorageResult<Option<MemoryItem>> {
        let payload = self
            .backend
            .fetch(id)
            .await
            .map_err(vector_error)?;
        payload.map(|p| decode_item(&p)).transpose()
    }

    async fn remove(&self, id: &str) -> StorageResult<()> {
        self.backend
            .remove(id)
            .await
            .map_err(vector_error)
    }

    async fn similar(&self, embedding: &[f32], top_k: usize) -> StorageResult<Vec<(String, f32)>> {
        self.backend
            .query(embedding, top_k)
            .await
            .map_err(vector_error)
    }
}

/// L4: cold blob archive.
pub struct ArchiveAdapter {
    backend: Arc<dyn ArchiveBackend>,
}

impl ArchiveAdapter {
    pub fn new(backend: Arc<dyn ArchiveBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl StorageAdapter for ArchiveAdapter {
    fn tier(&self) -> Tier {
        Tier::L4
    }

    async fn write(&self, item: &MemoryItem) -> StorageResult<()> {
        let bytes = encode_item(item)?;
        self.backend
            .put_blob(&item.id, bytes)
            .await
            .map_err(|e| StorageError::unreachable(Tier::L4, e))
    }

    async fn read(&self, id: &str) -> StorageResult<Option<MemoryItem>> {
        let bytes = self
            .backend
            .get_blob(id)
            .await
            .map_err(|e| StorageError::unreachable(Tier::L4, e))?;
        bytes.map(|b| decode_item(&b)).transpose()
    }

    async fn remove(&self, id: &str) -> StorageResult<()> {
        self.backend
            .delete_blob(id)
            .await
            .map_err(|e| StorageError::unreachable(Tier::L4, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fast_cache::InMemoryFastCache;

    #[tokio::test]
    async fn test_local_adapter_ranks_embedded_items() {
        let adapter = LocalAdapter::new(4);
        adapter
            .write(&MemoryItem::text("a").with_id("a").with_embedding(vec![1.0, 0.0]))
            .await
            .unwrap();
        adapter
            .write(&MemoryItem::text("b").with_id("b").with_embedding(vec![0.0, 1.0]))
            .await
            .unwrap();
        adapter.write(&MemoryItem::text("plain").with_id("c")).await.unwrap();

        let ranked = adapter.similar(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, "a");
    }

    #[tokio::test]
    async fn test_cache_adapter_skips_already_expired_items() {
        let adapter = CacheAdapter::new(
            Arc::new(InMemoryFastCache::new(8)),
            Duration::from_secs(60),
        );
        let mut item = MemoryItem::text("stale").with_id("stale");
        item.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(5));

        adapter.write(&item).await.unwrap();
        assert!(adapter.read("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_operations_name_the_tier() {
        let adapter = CacheAdapter::new(
            Arc::new(InMemoryFastCache::new(8)),
            Duration::from_secs(60),
        );
        let err = adapter.similar(&[1.0], 1).await.unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { tier: Tier::L1, .. }));
    }

    #[tokio::test]
    async fn test_vector_dimension_mismatch_is_invalid_not_unreachable() {
        use crate::memory::vector_store::{VectorStore, VectorStoreConfig};

        let adapter = VectorAdapter::new(Arc::new(VectorStore::new(VectorStoreConfig {
            embedding_dim: 3,
            ..Default::default()
        })));
        let item = MemoryItem::text("short").with_id("short").with_embedding(vec![1.0]);

        let err = adapter.write(&item).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid { tier: Tier::L3, .. }));
        let err = adapter.similar(&[1.0, 0.0], 1).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid { tier: Tier::L3, .. }));
    }
}
