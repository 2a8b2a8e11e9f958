//! In-process vector index for the semantic L3 tier.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, instrument, warn};

use super::cosine_similarity;

/// Rejected embedding; the caller sent the wrong number of components.
#[derive(Debug, thiserror::Error)]
#[error("embedding dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Client contract for a vector / semantic index.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn upsert(&self, id: &str, embedding: Vec<f32>, payload: Vec<u8>) -> Result<()>;
    /// Ranked `(id, similarity)` pairs, best first.
    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<(String, f32)>>;
    async fn fetch(&self, id: &str) -> Result<Option<Vec<u8>>>;
    async fn remove(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub max_entries: usize,
    /// Expected embedding length; 0 accepts any length.
    pub embedding_dim: usize,
    pub cache_size: usize,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            embedding_dim: 0,
            cache_size: 1_024,
        }
    }
}

struct VectorEntry {
    embedding: Vec<f32>,
    payload: Vec<u8>,
    /// Insertion order, used to pick eviction victims.
    seq: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VectorStoreStats {
    pub entries: usize,
    pub searches: u64,
    pub cache_hits: u64,
}

/// Brute-force cosine index with an LRU cache of recent query results.
pub struct VectorStore {
    config: VectorStoreConfig,
    entries: DashMap<String, VectorEntry>,
    similarity_cache: Mutex<LruCache<String, Vec<(String, f32)>>>,
    next_seq: AtomicU64,
    /// Bumped on every mutation; a query only caches results computed in a single generation.
    generation: AtomicU64,
    searches: AtomicU64,
    cache_hits: AtomicU64,
}

impl VectorStore {
    pub fn new(config: VectorStoreConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            entries: DashMap::new(),
            similarity_cache: Mutex::new(LruCache::new(cache_size)),
            next_seq: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            searches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> VectorStoreStats {
        VectorStoreStats {
            entries: self.entries.len(),
            searches: self.searches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    fn check_dim(&self, embedding: &[f32]) -> Result<()> {
        if self.config.embedding_dim != 0 && embedding.len() != self.config.embedding_dim {
            return Err(DimensionMismatch {
                expected: self.config.embedding_dim,
                actual: embedding.len(),
            }
            .into());
        }
        Ok(())
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().seq)
            .map(|entry| entry.key().clone());

        if let Some(id) = oldest {
            self.entries.remove(&id);
            warn!("Evicted vector entry {} due to capacity limit", id);
        }
    }

    /// Must run after the entry map changed so an in-flight query sees the new generation.
    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.similarity_cache.lock().clear();
    }

    fn cache_key(embedding: &[f32], top_k: usize) -> String {
        let mut hasher = blake3::Hasher::new();
        for value in embedding {
            hasher.update(&value.to_le_bytes());
        }
        format!("{}:{}", hasher.finalize().to_hex(), top_k)
    }
}

#[async_trait]
impl VectorBackend for VectorStore {
    #[instrument(skip(self, embedding, payload))]
    async fn upsert(&self, id: &str, embedding: Vec<f32>, payload: Vec<u8>) -> Result<()> {
        self.check_dim(&embedding)?;

        if !self.entries.contains_key(id) && self.entries.len() >= self.config.max_entries {
            self.evict_oldest();
        }

        self.entries.insert(
            id.to_string(),
            VectorEntry {
                embedding,
                payload,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        self.invalidate();
        debug!("Indexed {} ({} entries)", id, self.entries.len());
        Ok(())
    }

    #[instrument(skip(self, embedding))]
    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<(String, f32)>> {
        self.check_dim(embedding)?;
        self.searches.fetch_add(1, Ordering::Relaxed);

        let key = Self::cache_key(embedding, top_k);
        if let Some(cached) = self.similarity_cache.lock().get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let snapshot: Vec<(String, Vec<f32>)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().embedding.clone()))
            .collect();

        let mut ranked: Vec<(String, f32)> = snapshot
            .par_iter()
            .map(|(id, candidate)| (id.clone(), cosine_similarity(embedding, candidate)))
            .collect();

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(top_k);

        let mut cache = self.similarity_cache.lock();
        if self.generation.load(Ordering::SeqCst) == generation {
            cache.put(key, ranked.clone());
        }
        Ok(ranked)
    }

    async fn fetch(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(id).map(|entry| entry.value().payload.clone()))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        if self.entries.remove(id).is_some() {
            self.invalidate();
        }
        Ok(())
    }
}
