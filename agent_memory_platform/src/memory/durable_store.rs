//! Durable working-store back-ends for the authoritative L2 tier.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use tracing::{info, instrument};

/// Client contract for a transactional key/value store.
#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Atomically replace the value under `key`; returns once durable.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Every stored entry; used by the archival sweep.
    async fn scan(&self) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Embedded sled database, flushed on every write.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("Failed to open durable store at {:?}", path))?;
        info!("Opened durable store at {:?}", path);
        Ok(Self { db })
    }

    /// Scratch database removed on drop; for tests and ephemeral runs.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("Failed to open temporary durable store")?;
        Ok(Self { db })
    }
}

#[async_trait]
impl DurableBackend for SledStore {
    #[instrument(skip(self, value), fields(bytes = value.len()))]
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db.insert(key.as_bytes(), value)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry?;
            entries.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(entries)
    }
}

/// Process-memory stand-in for the durable store (development and tests).
#[derive(Default)]
pub struct InMemoryDurableStore {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DurableBackend for InMemoryDurableStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }
}
