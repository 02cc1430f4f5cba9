//! Manually curated collections
//!
//! A collection is an ordered list of item ids with no membership rules.
//! Ids are resolved lazily against the live history, so deleting an item
//! never leaves a dangling entry visible to readers.

use super::merge::union_by_id;
use super::types::EnhancedHistoryItem;
use crate::clock::Clock;
use crate::storage::document::{decode_list, read_list, write_document};
use crate::storage::SharedStorage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A named, rule-free group of item ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCollection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

/// Request body for creating a collection
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewCollection {
    pub name: String,
    pub tags: Vec<String>,
    pub is_public: bool,
}

impl NewCollection {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Owns the collection list of one replica
pub struct CollectionManager {
    storage: Arc<dyn SharedStorage>,
    clock: Arc<dyn Clock>,
    key: String,
    collections: RwLock<CollectionState>,
}

#[derive(Default)]
struct CollectionState {
    list: Vec<CustomCollection>,
    /// Deletions not yet written
    removed: Vec<String>,
    /// Last write was skipped or failed
    unsynced: bool,
}

impl CollectionManager {
    /// Load collections from storage (empty on any failure)
    pub async fn load(storage: Arc<dyn SharedStorage>, clock: Arc<dyn Clock>, key: String) -> Self {
        let list = match read_list(storage.as_ref(), &key).await {
            Ok(list) => list.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(key = %key, "Failed to read collections: {}", e);
                Vec::new()
            }
        };
        Self {
            storage,
            clock,
            key,
            collections: RwLock::new(CollectionState {
                list,
                ..Default::default()
            }),
        }
    }

    pub async fn collections(&self) -> Vec<CustomCollection> {
        self.collections.read().await.list.clone()
    }

    pub async fn get(&self, id: &str) -> Option<CustomCollection> {
        self.collections
            .read()
            .await
            .list
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub async fn create_collection(&self, req: NewCollection) -> CustomCollection {
        let now = self.clock.now_millis();
        let collection = CustomCollection {
            id: format!("collection-{}", uuid::Uuid::new_v4()),
            name: req.name,
            items: Vec::new(),
            tags: req.tags,
            is_public: req.is_public,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.collections.write().await;
        state.list.push(collection.clone());
        self.persist(&mut state, None).await;

        tracing::info!(collection_id = %collection.id, name = %collection.name, "Collection created");
        collection
    }

    /// Append an item id. Returns false when the collection is missing or
    /// already holds the item.
    pub async fn add_to_collection(&self, collection_id: &str, item_id: &str) -> bool {
        let mut state = self.collections.write().await;
        let Some(collection) = state.list.iter_mut().find(|c| c.id == collection_id) else {
            tracing::warn!(collection_id, "add_to_collection: collection not found");
            return false;
        };
        if collection.items.iter().any(|i| i == item_id) {
            return false;
        }

        collection.items.push(item_id.to_string());
        collection.updated_at = self.clock.now_millis();
        self.persist(&mut state, None).await;
        true
    }

    pub async fn remove_from_collection(&self, collection_id: &str, item_id: &str) -> bool {
        let mut state = self.collections.write().await;
        let Some(collection) = state.list.iter_mut().find(|c| c.id == collection_id) else {
            return false;
        };
        let before = collection.items.len();
        collection.items.retain(|i| i != item_id);
        if collection.items.len() == before {
            return false;
        }

        collection.updated_at = self.clock.now_millis();
        self.persist(&mut state, None).await;
        true
    }

    pub async fn delete_collection(&self, collection_id: &str) -> bool {
        let mut state = self.collections.write().await;
        let before = state.list.len();
        state.list.retain(|c| c.id != collection_id);
        if state.list.len() == before {
            return false;
        }
        self.persist(&mut state, Some(collection_id)).await;
        true
    }

    /// Resolve a collection's ids against the live history, skipping ids
    /// that no longer exist
    pub async fn resolve_items(
        &self,
        collection_id: &str,
        history: &[EnhancedHistoryItem],
    ) -> Vec<EnhancedHistoryItem> {
        let Some(collection) = self.get(collection_id).await else {
            return Vec::new();
        };
        collection
            .items
            .iter()
            .filter_map(|id| history.iter().find(|h| h.item.id == *id).cloned())
            .collect()
    }

    /// Adopt the list another replica wrote. Returns true when it differs.
    pub async fn apply_remote(&self, raw: Option<&str>) -> bool {
        let remote = match raw.map(decode_list::<CustomCollection>) {
            Some(Ok(remote)) => remote,
            Some(Err(e)) => {
                tracing::debug!("Dropping unparseable remote collections: {}", e);
                return false;
            }
            None => Vec::new(),
        };

        let mut state = self.collections.write().await;
        if state.list == remote {
            return false;
        }
        state.list = remote;
        true
    }

    /// Retry a write that was deferred or failed. Returns true when the
    /// list is still unsynced.
    pub async fn flush(&self) -> bool {
        let mut state = self.collections.write().await;
        if state.unsynced {
            self.persist(&mut state, None).await;
        }
        state.unsynced
    }

    /// Read-merge-write: union with what storage holds, newer copy wins.
    /// An unreadable stored list defers the write.
    async fn persist(&self, state: &mut CollectionState, removed: Option<&str>) {
        if let Some(removed) = removed {
            state.removed.push(removed.to_string());
        }
        let stored = match read_list::<CustomCollection>(self.storage.as_ref(), &self.key).await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(key = %self.key, "Stored collections unreadable, deferring write: {}", e);
                state.unsynced = true;
                return;
            }
        };

        let mut merged = union_by_id(state.list.as_slice(), &stored, |mine, theirs| {
            theirs.updated_at > mine.updated_at
        });
        merged.retain(|c| !state.removed.contains(&c.id));
        state.list = merged;

        let landed = write_document(self.storage.as_ref(), &self.key, &state.list).await;
        if landed {
            state.removed.clear();
        }
        state.unsynced = !landed;
    }
}
