//! Volatile in-process backend

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::KeyValueBackend;
use crate::error::StorageError;

/// In-memory map. Clones share the same underlying data.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let guard = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        let mut guard = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        guard.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let mut guard = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        guard.remove(key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_data() {
        let a = MemoryBackend::new();
        let b = a.clone();

        assert!(a.set("k", "v").await.unwrap());
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_key_succeeds() {
        let backend = MemoryBackend::new();
        assert!(backend.remove("nothing").await.unwrap());
        assert!(backend.is_empty());
    }
}
