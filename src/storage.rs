//! Package Store Adapter.
//!
//! Path-addressed object storage for extracted package files. Paths are
//! `/`-separated keys relative to the store root; they never contain `..`
//! or a leading separator.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait PackageStore: Send + Sync {
    async fn put(&self, path: &str, data: Bytes) -> StorageResult<()>;
    async fn get(&self, path: &str) -> StorageResult<Bytes>;
    async fn exists(&self, path: &str) -> StorageResult<bool>;
    /// Removes every object under `prefix`. Returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize>;
}

/// Rejects keys that could escape the store root.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') || key.starts_with('\\') || key.contains('\\') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    for component in Path::new(key).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}

/// Local filesystem store rooted at `DATA_DIR`.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl PackageStore for FsStore {
    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, path: &str, data: Bytes) -> StorageResult<()> {
        let target = self.key_path(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&target).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        let target = self.key_path(path)?;
        match fs::read(&target).await {
            Ok(buf) => Ok(Bytes::from(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let target = self.key_path(path)?;
        match fs::metadata(&target).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let base = self.key_path(prefix)?;
        tokio::task::spawn_blocking(move || -> StorageResult<usize> {
            if !base.exists() {
                return Ok(0);
            }
            let mut removed = 0;
            // symlinks are removed, never followed
            for entry in WalkDir::new(&base).contents_first(true) {
                let entry = entry.map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
                if entry.file_type().is_dir() {
                    std::fs::remove_dir(entry.path())?;
                } else {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
        .map_err(|e| {
            StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
        })?
    }
}

/// In-process store used by tests and by the server when no `DATA_DIR` is usable.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StorageError {
        StorageError::Unavailable("memory store lock poisoned".into())
    }
}

#[async_trait]
impl PackageStore for MemoryStore {
    async fn put(&self, path: &str, data: Bytes) -> StorageResult<()> {
        validate_key(path)?;
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        validate_key(path)?;
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        validate_key(path)?;
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects.contains_key(path))
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        validate_key(prefix)?;
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        let before = objects.len();
        objects.retain(|k, _| !(k.starts_with(&dir) || k == prefix));
        Ok(before - objects.len())
    }
}
