//! Blob storage for session uploads
//!
//! Every session owns the disjoint key prefix `uploads/{code}/`, so deletes
//! never contend. Backends:
//! - `FsBlobStore`: files under a root directory, one path segment per key segment
//! - `MemoryBlobStore`: ordered map, for development and tests

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

pub const UPLOADS_ROOT: &str = "uploads/";

/// Key prefix holding every object of one session.
pub fn session_prefix(code: &str) -> String {
    format!("{}{}/", UPLOADS_ROOT, code)
}

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid blob key {0:?}")]
    InvalidKey(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    fn name(&self) -> &str;

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError>;

    /// All object keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError>;

    /// Delete every object under `prefix`. Missing prefixes delete nothing.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BlobError>;

    /// Distinct first-level names directly below `root`, sorted.
    async fn list_child_prefixes(&self, root: &str) -> Result<Vec<String>, BlobError>;
}

fn validate_key(key: &str) -> Result<(), BlobError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg == ".." || seg == ".");
    if invalid {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ============================================================================
// FsBlobStore
// ============================================================================

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        let rel = Path::new(key.trim_end_matches('/'));
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    /// Every regular file below `dir`.
    async fn walk(&self, dir: PathBuf) -> Result<Vec<PathBuf>, BlobError> {
        let mut files = Vec::new();
        let mut stack = vec![dir];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn name(&self) -> &str {
        "fs"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        if key.ends_with('/') {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let dir = self.path_for(prefix)?;
        let mut keys: Vec<String> = self
            .walk(dir)
            .await?
            .iter()
            .filter_map(|p| self.key_for(p))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BlobError> {
        let dir = self.path_for(prefix)?;
        let count = self.walk(dir.clone()).await?.len();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_child_prefixes(&self, root: &str) -> Result<Vec<String>, BlobError> {
        let dir = self.path_for(root)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

// ============================================================================
// MemoryBlobStore
// ============================================================================

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        validate_key(key)?;
        self.objects
            .lock()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BlobError> {
        validate_key(prefix)?;
        let mut objects = self.objects.lock().await;
        let doomed: Vec<String> = objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            objects.remove(key);
        }
        Ok(doomed.len())
    }

    async fn list_child_prefixes(&self, root: &str) -> Result<Vec<String>, BlobError> {
        let objects = self.objects.lock().await;
        let mut names: Vec<String> = Vec::new();
        for key in objects.keys().filter(|k| k.starts_with(root)) {
            if let Some((name, _)) = key[root.len()..].split_once('/') {
                if names.last().map(String::as_str) != Some(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.dedup();
        Ok(names)
    }
}
