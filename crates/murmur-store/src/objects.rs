//! Object storage implementations.
//!
//! Keys are slash-separated relative paths (`chat-media/<stamp>-<name>`).
//! Both stores accept repeated uploads of the same content under different
//! keys; deduplication is not their concern.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::backend::ObjectStorage;
use crate::error::{Result, StoreError};

/// Reject empty keys and keys that would escape the storage root.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(StoreError::InvalidKey(key.to_string())),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryObjects {
    objects: HashMap<String, (Bytes, String)>,
    /// Keys containing any of these fragments fail to upload.
    failing: Vec<String>,
    put_calls: usize,
}

/// Object store held in memory, with key-pattern fault injection.
#[derive(Clone)]
pub struct MemoryObjectStore {
    base_url: String,
    inner: Arc<Mutex<MemoryObjects>>,
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            inner: Arc::default(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, MemoryObjects> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every upload whose key contains `fragment`.
    pub fn fail_keys_containing(&self, fragment: &str) {
        self.inner().failing.push(fragment.to_string());
    }

    pub fn clear_failures(&self) {
        self.inner().failing.clear();
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner().objects.get(key).map(|(data, _)| data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn put_calls(&self) -> usize {
        self.inner().put_calls
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<String> {
        validate_key(key)?;
        let mut inner = self.inner();
        inner.put_calls += 1;
        if inner.failing.iter().any(|fragment| key.contains(fragment.as_str())) {
            warn!(key, "Injected upload failure");
            return Err(StoreError::ObjectStorage(format!("upload of {key} failed")));
        }
        debug!(key, size = data.len(), "Stored object");
        inner
            .objects
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(format!("{}/{}", self.base_url, key))
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Object store writing into a directory that is served at `base_url`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    base_path: PathBuf,
    base_url: String,
    max_size: usize,
}

impl FsObjectStore {
    pub async fn new(base_path: PathBuf, base_url: impl Into<String>, max_size: usize) -> Result<Self> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            StoreError::ObjectStorage(format!(
                "Failed to create object directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Object store initialized");

        Ok(Self {
            base_path,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        if !fs::try_exists(&path).await? {
            return Err(StoreError::NotFound);
        }
        Ok(fs::read(&path).await?)
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStore {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> Result<String> {
        if data.is_empty() {
            return Err(StoreError::ObjectStorage("Empty object".to_string()));
        }
        if data.len() > self.max_size {
            return Err(StoreError::ObjectTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &data)
            .await
            .map_err(|e| StoreError::ObjectStorage(format!("Failed to write {}: {}", key, e)))?;

        debug!(key, size = data.len(), "Stored object");
        Ok(format!("{}/{}", self.base_url, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (FsObjectStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf(), "https://cdn.test/", 1024)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let (store, _dir) = test_store().await;
        let url = store
            .put("chat-media/1-a.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.test/chat-media/1-a.png");
        assert_eq!(store.get("chat-media/1-a.png").await.unwrap(), b"png");
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (store, _dir) = test_store().await;
        for key in ["../escape", "/abs", "a/../../b", ""] {
            assert!(
                store.put(key, Bytes::from_static(b"x"), "image/png").await.is_err(),
                "{key} accepted"
            );
        }
    }

    #[tokio::test]
    async fn test_size_limits() {
        let (store, _dir) = test_store().await;
        assert!(store.put("a", Bytes::new(), "image/png").await.is_err());
        let big = Bytes::from(vec![0u8; 2048]);
        assert!(matches!(
            store.put("a", big, "image/png").await,
            Err(StoreError::ObjectTooLarge { size: 2048, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let (store, _dir) = test_store().await;
        assert!(matches!(store.get("nope").await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_memory_store_fault_injection() {
        let store = MemoryObjectStore::new("mem://bucket");
        store.fail_keys_containing("b.png");
        assert!(store
            .put("chat-media/1-b.png", Bytes::from_static(b"b"), "image/png")
            .await
            .is_err());
        let url = store
            .put("chat-media/1-a.png", Bytes::from_static(b"a"), "image/png")
            .await
            .unwrap();
        assert_eq!(url, "mem://bucket/chat-media/1-a.png");

        store.clear_failures();
        assert!(store
            .put("chat-media/2-b.png", Bytes::from_static(b"b"), "image/png")
            .await
            .is_ok());
        assert_eq!(store.put_calls(), 3);
        assert_eq!(store.keys().len(), 2);
    }
}
