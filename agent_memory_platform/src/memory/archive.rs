//! Cold archive back-ends for the L4 tier.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Client contract for a blob archive.
#[async_trait]
pub trait ArchiveBackend: Send + Sync {
    async fn put_blob(&self, id: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get_blob(&self, id: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_blob(&self, id: &str) -> Result<()>;
}

/// One file per blob under a root directory, named by the blake3 hash of the id.
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create archive directory {:?}", root))?;
        info!("Cold archive rooted at {:?}", root);
        Ok(Self { root })
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        let hash = blake3::hash(id.as_bytes()).to_hex();
        self.root.join(format!("{}.blob", hash))
    }
}

#[async_trait]
impl ArchiveBackend for FsArchive {
    async fn put_blob(&self, id: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.blob_path(id);
        let staging = path.with_extension("tmp");

        // Readers only ever see a complete blob.
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!("Archived {} ({} bytes) to {:?}", id, bytes.len(), path);
        Ok(())
    }

    async fn get_blob(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_blob(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryArchive {
    blobs: DashMap<String, Vec<u8>>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.blobs.contains_key(id)
    }
}

#[async_trait]
impl ArchiveBackend for InMemoryArchive {
    async fn put_blob(&self, id: &str, bytes: Vec<u8>) -> Result<()> {
        self.blobs.insert(id.to_string(), bytes);
        Ok(())
    }

    async fn get_blob(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(id).map(|b| b.value().clone()))
    }

    async fn delete_blob(&self, id: &str) -> Result<()> {
        self.blobs.remove(id);
        Ok(())
    }
}
