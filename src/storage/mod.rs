//! Shared storage medium
//!
//! Replicas share nothing but a text key-value medium that emits a change
//! signal to every replica except the writer. [`SharedStorage`] is that
//! medium; [`MemoryStorage`] models it in-process (one hub, one handle per
//! replica) and [`FileStorage`] maps it onto a directory of JSON documents.

pub mod document;
pub mod file;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Capacity of change-notification channels
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A change signal emitted by the medium after a write became visible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    /// Key that changed
    pub key: String,
    /// New raw value (`None` when the key was removed)
    pub new_value: Option<String>,
    /// Origin id of the handle that wrote it
    pub origin: String,
}

/// Text key-value storage shared by all replicas
#[async_trait]
pub trait SharedStorage: Send + Sync {
    /// Origin id of this handle; changes it writes are not echoed back to it
    fn origin(&self) -> &str;

    async fn get(&self, key: &str) -> crate::Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> crate::Result<()>;

    async fn remove(&self, key: &str) -> crate::Result<()>;

    /// Subscribe to changes written by other handles
    fn watch(&self) -> StorageChanges;
}

/// Stream of foreign storage changes for one handle
pub struct StorageChanges {
    rx: broadcast::Receiver<StorageChange>,
    origin: String,
}

impl StorageChanges {
    pub(crate) fn new(rx: broadcast::Receiver<StorageChange>, origin: impl Into<String>) -> Self {
        Self {
            rx,
            origin: origin.into(),
        }
    }

    /// Wait for the next change written by someone else.
    ///
    /// Returns `None` once the medium is gone.
    pub async fn next(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.origin == self.origin => continue,
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Dropped signals are recovered by the next write to the same key
                    tracing::warn!(skipped = n, origin = %self.origin, "Storage change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
