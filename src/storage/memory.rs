//! In-process shared storage
//!
//! One [`MemoryStorage`] hub can hand out any number of replica handles.
//! Every handle sees the same entries; a write through one handle is
//! signalled to all the others.

use super::{SharedStorage, StorageChange, StorageChanges, CHANGE_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
    /// Simulates a full medium (every write fails)
    quota_exceeded: AtomicBool,
}

/// Shared in-memory key-value medium, one handle per replica
#[derive(Clone)]
pub struct MemoryStorage {
    backend: Arc<MemoryBackend>,
    origin: String,
}

impl MemoryStorage {
    /// Create a new medium and return its first handle
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            backend: Arc::new(MemoryBackend {
                entries: RwLock::new(HashMap::new()),
                changes,
                quota_exceeded: AtomicBool::new(false),
            }),
            origin: format!("mem-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Another replica's handle onto the same medium
    pub fn handle(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            origin: format!("mem-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Make every subsequent write fail until reset
    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.backend.quota_exceeded.store(exceeded, Ordering::SeqCst);
    }

    /// Number of keys currently stored
    pub async fn len(&self) -> usize {
        self.backend.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn notify(&self, key: &str, new_value: Option<String>) {
        // No receivers is fine: nobody is watching yet
        let _ = self.backend.changes.send(StorageChange {
            key: key.to_string(),
            new_value,
            origin: self.origin.clone(),
        });
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStorage for MemoryStorage {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.backend.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.backend.quota_exceeded.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!(
                "quota exceeded while writing '{}'",
                key
            )));
        }
        self.backend
            .entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let removed = self.backend.entries.write().await.remove(key);
        if removed.is_some() {
            self.notify(key, None);
        }
        Ok(())
    }

    fn watch(&self) -> StorageChanges {
        StorageChanges::new(self.backend.changes.subscribe(), self.origin.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_and_get_shared_between_handles() {
        let a = MemoryStorage::new();
        let b = a.handle();

        a.set("k", "v1").await.unwrap();
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(a.len().await, 1);
        assert!(b.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writer_is_not_notified() {
        let a = MemoryStorage::new();
        let b = a.handle();
        let mut a_changes = a.watch();
        let mut b_changes = b.watch();

        a.set("k", "v1").await.unwrap();

        let change = b_changes.next().await.unwrap();
        assert_eq!(change.key, "k");
        assert_eq!(change.new_value.as_deref(), Some("v1"));
        assert_eq!(change.origin, a.origin());

        let echoed = tokio::time::timeout(Duration::from_millis(20), a_changes.next()).await;
        assert!(echoed.is_err(), "writer must not see its own write");
    }

    #[tokio::test]
    async fn test_remove_notifies() {
        let a = MemoryStorage::new();
        let b = a.handle();
        a.set("k", "v").await.unwrap();
        let mut b_changes = b.watch();

        a.remove("k").await.unwrap();
        let change = b_changes.next().await.unwrap();
        assert!(change.new_value.is_none());
        assert!(a.is_empty().await);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let a = MemoryStorage::new();
        a.set_quota_exceeded(true);
        let err = a.set("k", "v").await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert!(a.get("k").await.unwrap().is_none());

        a.set_quota_exceeded(false);
        assert!(a.set("k", "v").await.is_ok());
    }
}
