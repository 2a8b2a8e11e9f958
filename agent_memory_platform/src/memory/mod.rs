//! Tiered memory: item model, tier policy and the storage back-ends behind each tier.
//!
//! Items live authoritatively in the durable working store (L2). Faster tiers
//! (L0 process-local, L1 fast cache) hold promoted copies, the vector tier (L3)
//! indexes embeddings for recall, and the cold archive (L4) takes items that
//! have been inactive past the configured threshold.

pub mod adapter;
pub mod archive;
pub mod durable_store;
pub mod embedder;
pub mod fast_cache;
pub mod tier_manager;
pub mod vector_store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StorageResult;

pub use adapter::StorageAdapter;
pub use embedder::{Embedder, HashEmbedder};
pub use tier_manager::{TierManager, TierStats};

/// Storage layer in the L0 to L4 hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Process-local map.
    L0,
    /// Fast expiring cache.
    L1,
    /// Durable working store, the authoritative copy.
    L2,
    /// Semantic / vector index.
    L3,
    /// Cold archive.
    L4,
}

impl Tier {
    /// Lower value wins ties during recall.
    pub fn priority(&self) -> u8 {
        match self {
            Tier::L0 => 0,
            Tier::L1 => 1,
            Tier::L2 => 2,
            Tier::L3 => 3,
            Tier::L4 => 4,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::L0 => write!(f, "L0"),
            Tier::L1 => write!(f, "L1"),
            Tier::L2 => write!(f, "L2"),
            Tier::L3 => write!(f, "L3"),
            Tier::L4 => write!(f, "L4"),
        }
    }
}

/// Payload of a memory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryContent {
    Text(String),
    Binary(Vec<u8>),
}

impl MemoryContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MemoryContent::Text(text) => Some(text),
            MemoryContent::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MemoryContent::Text(text) => text.len(),
            MemoryContent::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A unit of agent memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub content: MemoryContent,
    pub embedding: Option<Vec<f32>>,
    pub tier: Tier,
    pub owner_ref: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Write counter assigned by the tier manager; cached copies with an older
    /// revision are ignored.
    pub revision: u64,
}

impl MemoryItem {
    pub fn new(content: MemoryContent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            embedding: None,
            tier: Tier::L2,
            owner_ref: None,
            metadata: HashMap::new(),
            created_at: now,
            last_accessed_at: now,
            expires_at: None,
            revision: 0,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MemoryContent::Text(content.into()))
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Self::new(MemoryContent::Binary(bytes))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_owner(mut self, owner_ref: impl Into<String>) -> Self {
        self.owner_ref = Some(owner_ref.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.created_at + ttl);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Time left before expiry, if the item expires at all.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }
}

/// Thresholds governing movement between tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Maximum items held in the process-local tier.
    pub l0_capacity: usize,
    /// TTL for copies mirrored into the fast cache.
    pub l1_ttl: Duration,
    /// Accesses within `access_window` needed before an item is promoted to L0.
    pub l0_promotion_hits: u32,
    pub access_window: Duration,
    /// Inactivity after which an item is moved to the cold archive.
    pub archive_after: Duration,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            l0_capacity: 1_024,
            l1_ttl: Duration::from_secs(15 * 60),
            l0_promotion_hits: 2,
            access_window: Duration::from_secs(5 * 60),
            archive_after: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

pub(crate) fn encode_item(item: &MemoryItem) -> StorageResult<Vec<u8>> {
    Ok(bincode::serialize(item)?)
}

pub(crate) fn decode_item(bytes: &[u8]) -> StorageResult<MemoryItem> {
    Ok(bincode::deserialize(bytes)?)
}

/// Cosine similarity; mismatched or zero-length vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_codec_preserves_fields() {
        let item = MemoryItem::text("the quick brown fox")
            .with_owner("session-1")
            .with_embedding(vec![0.1, 0.2, 0.3])
            .with_metadata("source", "unit")
            .with_ttl(Duration::from_secs(60));

        let bytes = encode_item(&item).unwrap();
        let decoded = decode_item(&bytes).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_expiry() {
        let item = MemoryItem::text("short lived").with_ttl(Duration::from_secs(1));
        assert!(!item.is_expired(item.created_at));
        assert!(item.is_expired(item.created_at + chrono::Duration::seconds(2)));
        assert!(MemoryItem::text("forever").remaining_ttl(Utc::now()).is_none());
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_tier_priority_orders_faster_first() {
        assert!(Tier::L0.priority() < Tier::L1.priority());
        assert!(Tier::L1.priority() < Tier::L3.priority());
    }
}
