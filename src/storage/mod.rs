//! Blob storage for capture artifacts, keyed `captures/<capture_id>/<file>`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

mod s3;

pub use s3::{S3BlobStore, S3Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Screenshot,
    Dom,
    Manifest,
    Event,
}

impl Artifact {
    pub fn file_name(self) -> &'static str {
        match self {
            Artifact::Screenshot => "screenshot.png",
            Artifact::Dom => "dom.html",
            Artifact::Manifest => "manifest.json",
            Artifact::Event => "event.json",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Artifact::Screenshot => "image/png",
            Artifact::Dom => "text/html; charset=utf-8",
            Artifact::Manifest | Artifact::Event => "application/json",
        }
    }

    pub fn key(self, capture_id: &str) -> String {
        format!("captures/{}/{}", capture_id, self.file_name())
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, content_type: &str, data: Vec<u8>) -> Result<()>;

    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().await.get(key).map(|(ct, _)| ct.clone())
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, content_type: &str, data: Vec<u8>) -> Result<()> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), (content_type.to_string(), data));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).map(|(_, data)| data.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

/// Stores each key as a file under `root`. Content types are not kept;
/// intended for local development.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(Error::Storage(format!("invalid key: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, _content_type: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| Error::Storage(format!("write {}: {}", key, e)))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("read {}: {}", key, e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("delete {}: {}", key, e))),
        }
    }
}
