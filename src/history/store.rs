//! History store: the canonical item list of one replica
//!
//! Every write is classified, deduplicated, persisted and announced before
//! the call returns. Persistence is read-merge-write against the shared
//! medium: the stored list is merged with the local view (union by id,
//! newer revision wins, tombstones hide deleted ids) so replicas writing at
//! the same time converge instead of overwriting each other.
//!
//! Public operations never return errors. Storage and parse failures are
//! logged and degrade to in-memory-only state. A stored list that cannot be
//! read is never merged as if it were empty: the write is deferred and
//! retried by [`HistoryStore::flush`].

use super::classify::{classify, default_smart_folders, NewSmartFolder, SmartFolder};
use super::merge::{merge_history, merge_tombstones, sort_history, union_by_id, Tombstones};
use super::similarity::{check_for_duplicates, DuplicateGroup};
use super::tagging::Tagger;
use super::types::*;
use crate::clock::Clock;
use crate::config::StorageKeys;
use crate::storage::document::{decode_list, read_document, read_list, write_document};
use crate::storage::SharedStorage;
use crate::subscription::{Subscription, SubscriptionRegistry};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Channel on which the full item list is published after every change
pub const HISTORY_CHANNEL: &str = "history";

/// Shared dependencies and tunables of a store
pub struct StoreContext {
    pub storage: Arc<dyn SharedStorage>,
    pub clock: Arc<dyn Clock>,
    pub tagger: Arc<dyn Tagger>,
    pub keys: StorageKeys,
    pub duplicate_threshold: f64,
}

/// Stored documents owned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Document {
    History,
    Tombstones,
    Groups,
    Folders,
}

#[derive(Default)]
struct StoreState {
    items: Vec<EnhancedHistoryItem>,
    folders: Vec<SmartFolder>,
    groups: Vec<DuplicateGroup>,
    tombstones: Tombstones,
    /// Documents whose last write was skipped or failed
    unsynced: BTreeSet<Document>,
    /// Folder deletions not yet written
    removed_folders: Vec<String>,
}

impl StoreState {
    fn mark(&mut self, document: Document, landed: bool) {
        if landed {
            self.unsynced.remove(&document);
        } else {
            self.unsynced.insert(document);
        }
    }
}

/// Versioned, classified, deduplicated content history
pub struct HistoryStore {
    ctx: StoreContext,
    state: RwLock<StoreState>,
    listeners: SubscriptionRegistry<Vec<EnhancedHistoryItem>>,
}

impl HistoryStore {
    /// Load every list from storage, bootstrapping the default smart
    /// folders when none are stored
    pub async fn load(ctx: StoreContext) -> Self {
        let storage = ctx.storage.as_ref();
        let tombstones: Tombstones = or_logged(
            read_document(storage, &ctx.keys.tombstones).await,
            &ctx.keys.tombstones,
        )
        .unwrap_or_default();
        let mut items: Vec<EnhancedHistoryItem> =
            or_logged(read_list(storage, &ctx.keys.history).await, &ctx.keys.history)
                .unwrap_or_default();
        items = merge_history(&items, &[], &tombstones);
        let groups: Vec<DuplicateGroup> = or_logged(
            read_list(storage, &ctx.keys.duplicate_groups).await,
            &ctx.keys.duplicate_groups,
        )
        .unwrap_or_default();

        let now = ctx.clock.now_millis();
        let folders = match read_list::<SmartFolder>(storage, &ctx.keys.smart_folders).await {
            Ok(Some(folders)) => folders,
            Ok(None) => {
                let defaults = default_smart_folders(now);
                write_document(storage, &ctx.keys.smart_folders, &defaults).await;
                tracing::info!(count = defaults.len(), "Bootstrapped default smart folders");
                defaults
            }
            Err(e) => {
                // Never overwrite a folder list we could not read
                tracing::warn!(key = %ctx.keys.smart_folders, "Failed to read smart folders, using defaults locally: {}", e);
                default_smart_folders(now)
            }
        };

        tracing::debug!(
            items = items.len(),
            folders = folders.len(),
            groups = groups.len(),
            "History store loaded"
        );

        Self {
            ctx,
            state: RwLock::new(StoreState {
                items,
                folders,
                groups,
                tombstones,
                unsynced: BTreeSet::new(),
                removed_folders: Vec::new(),
            }),
            listeners: SubscriptionRegistry::new(),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn items(&self) -> Vec<EnhancedHistoryItem> {
        self.state.read().await.items.clone()
    }

    pub async fn get(&self, id: &str) -> Option<EnhancedHistoryItem> {
        self.state
            .read()
            .await
            .items
            .iter()
            .find(|i| i.item.id == id)
            .cloned()
    }

    pub async fn duplicate_groups(&self) -> Vec<DuplicateGroup> {
        self.state.read().await.groups.clone()
    }

    /// Smart folders with `itemCount` refreshed from current membership
    pub async fn smart_folders(&self) -> Vec<SmartFolder> {
        let state = self.state.read().await;
        state
            .folders
            .iter()
            .map(|folder| {
                let mut folder = folder.clone();
                folder.item_count = state
                    .items
                    .iter()
                    .filter(|i| i.smart_folders.contains(&folder.id))
                    .count();
                folder
            })
            .collect()
    }

    pub async fn items_in_folder(&self, folder_id: &str) -> Vec<EnhancedHistoryItem> {
        self.state
            .read()
            .await
            .items
            .iter()
            .filter(|i| i.smart_folders.iter().any(|f| f == folder_id))
            .cloned()
            .collect()
    }

    /// Listen for full-list updates
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Vec<EnhancedHistoryItem>) + Send + Sync + 'static,
    {
        self.listeners.subscribe(HISTORY_CHANNEL, listener)
    }

    fn notify(&self, items: &Vec<EnhancedHistoryItem>) {
        self.listeners.emit(HISTORY_CHANNEL, items);
    }

    // =========================================================================
    // Item mutations
    // =========================================================================

    /// Add an item, or return the existing one when its id is already known.
    ///
    /// Always returns a usable item: if enrichment fails the item is stored
    /// with defaulted fields and no folders or versions.
    pub async fn add_item(&self, new: NewHistoryItem) -> EnhancedHistoryItem {
        let now = self.ctx.clock.now_millis();
        let (base, analytics) = normalize(new, now);

        let (added, snapshot) = {
            let mut state = self.state.write().await;
            if let Some(existing) = state.items.iter().find(|i| i.item.id == base.id) {
                tracing::debug!(item_id = %base.id, "add_item: id already present");
                return existing.clone();
            }

            let mut item = match self.enrich(&state.folders, base.clone(), analytics, now) {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!(item_id = %base.id, "Failed to enrich history item, storing fallback: {}", e);
                    fallback_item(base, analytics, now)
                }
            };

            if !item.versions.is_empty() {
                let group_id = format!("dup-{}", uuid::Uuid::new_v4());
                if let Some(group) = check_for_duplicates(
                    &item,
                    &state.items,
                    group_id,
                    self.ctx.duplicate_threshold,
                ) {
                    tracing::info!(
                        item_id = %item.item.id,
                        group_id = %group.id,
                        matches = group.items.len() - 1,
                        kind = ?group.kind,
                        "Duplicate content detected"
                    );
                    item.duplicate_group_id = Some(group.id.clone());
                    state.groups.push(group);
                    self.persist_groups(&mut state).await;
                }
            }

            // Re-adding a deleted id revives it: the new copy must outrank
            // the tombstone or the next merge would hide it again
            if let Some(&deleted_at) = state.tombstones.get(&item.item.id) {
                if deleted_at >= item.revision().0 {
                    tracing::debug!(item_id = %item.item.id, deleted_at, "Reviving deleted id");
                    item.updated_at = deleted_at + 1;
                }
            }

            state.items.insert(0, item.clone());
            self.persist_items(&mut state).await;

            let stored = match state.items.iter().find(|i| i.item.id == item.item.id) {
                Some(stored) => stored.clone(),
                None => {
                    tracing::warn!(item_id = %item.item.id, "Added item was hidden by a merge");
                    item
                }
            };
            (stored, state.items.clone())
        };

        tracing::debug!(item_id = %added.item.id, folders = ?added.smart_folders, "History item added");
        self.notify(&snapshot);
        added
    }

    /// Shallow-merge `update` into an item. No-op (returns `None`) when the
    /// id is unknown.
    pub async fn update_item(
        &self,
        id: &str,
        update: HistoryItemUpdate,
    ) -> Option<EnhancedHistoryItem> {
        let now = self.ctx.clock.now_millis();
        let (updated, snapshot) = {
            let mut state = self.state.write().await;
            let folders = state.folders.clone();
            let item = state.items.iter_mut().find(|i| i.item.id == id)?;

            let retag = apply_update(item, update, now);
            if retag {
                match self.ctx.tagger.tags(&item.item) {
                    Ok(tags) => item.ai_tags = tags,
                    Err(e) => tracing::warn!(item_id = id, "Keeping previous tags: {}", e),
                }
            }
            item.smart_folders = classify(item, &folders);
            item.updated_at = now;
            let updated = item.clone();

            self.persist_items(&mut state).await;
            (updated, state.items.clone())
        };

        self.notify(&snapshot);
        Some(updated)
    }

    /// Set an item's rating; the last call wins
    pub async fn update_rating(&self, id: &str, rating: Rating) -> Option<EnhancedHistoryItem> {
        tracing::info!(item_id = id, rating = rating.as_i8(), "Updating rating");
        self.update_item(id, HistoryItemUpdate::rating(rating)).await
    }

    /// Remove an item. Duplicate groups drop the id in the same step;
    /// collections filter it when read.
    pub async fn delete_item(&self, id: &str) -> bool {
        let now = self.ctx.clock.now_millis();
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(pos) = state.items.iter().position(|i| i.item.id == id) else {
                return false;
            };
            let removed = state.items.remove(pos);

            // Must cover the removed copy even when its timestamp is ahead of the clock
            let deleted_at = now
                .max(removed.revision().0)
                .max(state.tombstones.get(id).copied().unwrap_or(0));
            state.tombstones.insert(id.to_string(), deleted_at);

            let dropped = prune_groups(&mut state.groups, id);
            if !dropped.is_empty() {
                for item in state.items.iter_mut() {
                    if item
                        .duplicate_group_id
                        .as_ref()
                        .is_some_and(|g| dropped.contains(g))
                    {
                        item.duplicate_group_id = None;
                    }
                }
            }

            self.persist_tombstones(&mut state).await;
            self.persist_groups(&mut state).await;
            self.persist_items(&mut state).await;
            state.items.clone()
        };

        tracing::info!(item_id = id, "History item deleted");
        self.notify(&snapshot);
        true
    }

    /// Record collection membership on an item. Derived bookkeeping: does
    /// not bump the item's revision.
    pub(crate) async fn set_collection_membership(
        &self,
        item_id: &str,
        collection_id: &str,
        member: bool,
    ) -> bool {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(item) = state.items.iter_mut().find(|i| i.item.id == item_id) else {
                return false;
            };
            let present = item.collections.iter().any(|c| c == collection_id);
            match (member, present) {
                (true, false) => item.collections.push(collection_id.to_string()),
                (false, true) => item.collections.retain(|c| c != collection_id),
                _ => return false,
            }
            self.persist_items(&mut state).await;
            state.items.clone()
        };
        self.notify(&snapshot);
        true
    }

    /// Forget a deleted collection on every item
    pub(crate) async fn strip_collection(&self, collection_id: &str) {
        let snapshot = {
            let mut state = self.state.write().await;
            let mut changed = false;
            for item in state.items.iter_mut() {
                let before = item.collections.len();
                item.collections.retain(|c| c != collection_id);
                changed |= item.collections.len() != before;
            }
            if !changed {
                return;
            }
            self.persist_items(&mut state).await;
            state.items.clone()
        };
        self.notify(&snapshot);
    }

    // =========================================================================
    // Smart folders
    // =========================================================================

    /// Create a folder; auto-organizing folders retroactively classify the
    /// whole history
    pub async fn create_smart_folder(&self, req: NewSmartFolder) -> SmartFolder {
        let folder = SmartFolder {
            id: format!("folder-{}", uuid::Uuid::new_v4()),
            name: req.name,
            rules: req.rules,
            auto_organize: req.auto_organize,
            item_count: 0,
        };

        {
            let mut state = self.state.write().await;
            state.folders.push(folder.clone());
            self.persist_folders(&mut state, None).await;
        }
        tracing::info!(folder_id = %folder.id, name = %folder.name, "Smart folder created");

        if folder.auto_organize {
            self.reorganize_all_items().await;
            if let Some(counted) = self
                .smart_folders()
                .await
                .into_iter()
                .find(|f| f.id == folder.id)
            {
                return counted;
            }
        }
        folder
    }

    pub async fn delete_smart_folder(&self, folder_id: &str) -> bool {
        let snapshot = {
            let mut state = self.state.write().await;
            let before = state.folders.len();
            state.folders.retain(|f| f.id != folder_id);
            if state.folders.len() == before {
                return false;
            }
            for item in state.items.iter_mut() {
                item.smart_folders.retain(|f| f != folder_id);
            }
            self.persist_folders(&mut state, Some(folder_id)).await;
            self.persist_items(&mut state).await;
            state.items.clone()
        };
        self.notify(&snapshot);
        true
    }

    /// Clear and recompute every item's smart folders
    pub async fn reorganize_all_items(&self) {
        let snapshot = {
            let mut state = self.state.write().await;
            reclassify(&mut state);
            self.persist_items(&mut state).await;
            state.items.clone()
        };
        tracing::debug!(items = snapshot.len(), "Reorganized all items");
        self.notify(&snapshot);
    }

    /// Retry writes that were deferred or failed. Returns how many
    /// documents are still unsynced.
    pub async fn flush(&self) -> usize {
        let (snapshot, remaining) = {
            let mut state = self.state.write().await;
            if state.unsynced.is_empty() {
                return 0;
            }
            let before = state.items.clone();
            let pending: Vec<Document> = state.unsynced.iter().copied().collect();
            for document in pending {
                match document {
                    Document::History => self.persist_items(&mut state).await,
                    Document::Tombstones => self.persist_tombstones(&mut state).await,
                    Document::Groups => self.persist_groups(&mut state).await,
                    Document::Folders => self.persist_folders(&mut state, None).await,
                }
            }
            let remaining = state.unsynced.len();
            if remaining > 0 {
                tracing::debug!(remaining, "Some stored documents are still unsynced");
            }
            if state.items == before {
                return remaining;
            }
            (state.items.clone(), remaining)
        };

        self.notify(&snapshot);
        remaining
    }

    // =========================================================================
    // Remote changes
    // =========================================================================

    /// Merge a history list written by another replica. Writes the merge
    /// back when this replica holds items the remote list lacks.
    pub async fn apply_remote_history(&self, raw: Option<&str>) -> bool {
        let Some(raw) = raw else {
            return false;
        };
        let mut remote: Vec<EnhancedHistoryItem> = match decode_list(raw) {
            Ok(remote) => remote,
            Err(e) => {
                tracing::debug!("Dropping unparseable remote history: {}", e);
                return false;
            }
        };
        sort_history(&mut remote);

        let key = &self.ctx.keys.tombstones;
        let stored_tombstones: Tombstones =
            or_logged(read_document(self.ctx.storage.as_ref(), key).await, key).unwrap_or_default();

        let snapshot = {
            let mut state = self.state.write().await;
            merge_tombstones(&mut state.tombstones, &stored_tombstones);

            // Remote copy wins ties so replicas settle on what was written
            let merged = merge_history(&remote, &state.items, &state.tombstones);
            let changed = merged != state.items;
            let needs_write_back = merged != remote;
            state.items = merged;

            if needs_write_back {
                tracing::debug!("Local history has entries the remote list lacks; writing back");
                self.persist_items(&mut state).await;
            }
            if !changed {
                return false;
            }
            state.items.clone()
        };

        self.notify(&snapshot);
        true
    }

    pub async fn apply_remote_tombstones(&self, raw: Option<&str>) -> bool {
        let Some(remote) = raw.and_then(|raw| parse_remote::<Tombstones>(raw, "tombstones")) else {
            return false;
        };

        let snapshot = {
            let mut state = self.state.write().await;
            if !merge_tombstones(&mut state.tombstones, &remote) {
                return false;
            }
            let merged = merge_history(&state.items, &[], &state.tombstones);
            if merged == state.items {
                return false;
            }
            state.items = merged;
            state.items.clone()
        };

        self.notify(&snapshot);
        true
    }

    /// Adopt another replica's folder list and reclassify locally
    pub async fn apply_remote_folders(&self, raw: Option<&str>) -> bool {
        let Some(remote) = raw.and_then(|raw| parse_remote_list::<SmartFolder>(raw, "smart folders"))
        else {
            return false;
        };

        let snapshot = {
            let mut state = self.state.write().await;
            if state.folders == remote {
                return false;
            }
            state.folders = remote;
            reclassify(&mut state);
            state.items.clone()
        };

        self.notify(&snapshot);
        true
    }

    pub async fn apply_remote_groups(&self, raw: Option<&str>) -> bool {
        let Some(remote) =
            raw.and_then(|raw| parse_remote_list::<DuplicateGroup>(raw, "duplicate groups"))
        else {
            return false;
        };

        let mut state = self.state.write().await;
        let mut merged = union_by_id(&state.groups, &remote, |_, _| false);
        let deleted: Vec<String> = state.tombstones.keys().cloned().collect();
        for id in &deleted {
            prune_groups(&mut merged, id);
        }
        if merged == state.groups {
            return false;
        }
        state.groups = merged;
        true
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn enrich(
        &self,
        folders: &[SmartFolder],
        base: HistoryItem,
        analytics: AnalyticsData,
        now: u64,
    ) -> crate::Result<EnhancedHistoryItem> {
        let ai_tags = self.ctx.tagger.tags(&base)?;
        let mut item = EnhancedHistoryItem {
            versions: vec![VersionEntry {
                id: format!("ver-{}", uuid::Uuid::new_v4()),
                content: base.content.clone(),
                timestamp: now,
                change_note: INITIAL_VERSION_NOTE.to_string(),
            }],
            item: base,
            smart_folders: Vec::new(),
            collections: Vec::new(),
            duplicate_group_id: None,
            ai_tags,
            analytics_data: analytics,
            updated_at: now,
        };
        item.smart_folders = classify(&item, folders);
        Ok(item)
    }

    // Each persist reads the stored document first. An unreadable document
    // defers the write instead of being merged as an empty list.

    async fn persist_items(&self, state: &mut StoreState) {
        let storage = self.ctx.storage.as_ref();
        let keys = &self.ctx.keys;
        let stored_tombstones = match read_document::<Tombstones>(storage, &keys.tombstones).await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => return defer(state, Document::History, &keys.tombstones, &e),
        };
        let stored = match read_list::<EnhancedHistoryItem>(storage, &keys.history).await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => return defer(state, Document::History, &keys.history, &e),
        };

        merge_tombstones(&mut state.tombstones, &stored_tombstones);
        state.items = merge_history(&state.items, &stored, &state.tombstones);
        let landed = write_document(storage, &keys.history, &state.items).await;
        state.mark(Document::History, landed);
    }

    async fn persist_tombstones(&self, state: &mut StoreState) {
        let storage = self.ctx.storage.as_ref();
        let key = &self.ctx.keys.tombstones;
        match read_document::<Tombstones>(storage, key).await {
            Ok(stored) => {
                merge_tombstones(&mut state.tombstones, &stored.unwrap_or_default());
            }
            Err(e) => return defer(state, Document::Tombstones, key, &e),
        }
        let landed = write_document(storage, key, &state.tombstones).await;
        state.mark(Document::Tombstones, landed);
    }

    async fn persist_groups(&self, state: &mut StoreState) {
        let storage = self.ctx.storage.as_ref();
        let key = &self.ctx.keys.duplicate_groups;
        let stored = match read_list::<DuplicateGroup>(storage, key).await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => return defer(state, Document::Groups, key, &e),
        };
        let mut merged = union_by_id(&state.groups, &stored, |_, _| false);
        let deleted: Vec<String> = state.tombstones.keys().cloned().collect();
        for id in &deleted {
            prune_groups(&mut merged, id);
        }
        state.groups = merged;
        let landed = write_document(storage, key, &state.groups).await;
        state.mark(Document::Groups, landed);
    }

    async fn persist_folders(&self, state: &mut StoreState, removed: Option<&str>) {
        if let Some(removed) = removed {
            state.removed_folders.push(removed.to_string());
        }
        let storage = self.ctx.storage.as_ref();
        let key = &self.ctx.keys.smart_folders;
        let stored = match read_list::<SmartFolder>(storage, key).await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => return defer(state, Document::Folders, key, &e),
        };
        let mut merged = union_by_id(&state.folders, &stored, |_, _| false);
        merged.retain(|f| !state.removed_folders.contains(&f.id));
        state.folders = merged;
        let landed = write_document(storage, key, &state.folders).await;
        if landed {
            state.removed_folders.clear();
        }
        state.mark(Document::Folders, landed);
    }
}

fn defer(state: &mut StoreState, document: Document, key: &str, err: &crate::Error) {
    tracing::warn!(key, ?document, "Stored document unreadable, deferring write: {}", err);
    state.unsynced.insert(document);
}

/// Log a failed read and treat it as missing. Writes re-read the document
/// themselves, so this never feeds a merge.
fn or_logged<T>(read: crate::Result<Option<T>>, key: &str) -> Option<T> {
    read.unwrap_or_else(|e| {
        tracing::warn!(key, "Failed to read stored document: {}", e);
        None
    })
}

/// Fill defaults for every missing field
fn normalize(new: NewHistoryItem, now: u64) -> (HistoryItem, AnalyticsData) {
    let id = match new.id {
        Some(id) if !id.trim().is_empty() => id,
        _ => format!("item-{}", uuid::Uuid::new_v4()),
    };
    let content = new.content.unwrap_or_else(|| {
        tracing::warn!(item_id = %id, "History item has no content, storing empty string");
        String::new()
    });
    let title = new
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    let item = HistoryItem {
        id,
        title,
        content_type: new.content_type.unwrap_or_default(),
        content,
        platform: new
            .platform
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "general".to_string()),
        timestamp: new.timestamp.unwrap_or(now),
        tags: new.tags,
        rating: new.rating.unwrap_or_default(),
        starred: new.starred,
    };
    (item, new.analytics_data.unwrap_or_default())
}

fn fallback_item(base: HistoryItem, analytics: AnalyticsData, now: u64) -> EnhancedHistoryItem {
    EnhancedHistoryItem {
        item: base,
        smart_folders: Vec::new(),
        collections: Vec::new(),
        duplicate_group_id: None,
        ai_tags: Vec::new(),
        analytics_data: analytics,
        versions: Vec::new(),
        updated_at: now,
    }
}

/// Apply a partial update. Returns true when title or content changed.
fn apply_update(item: &mut EnhancedHistoryItem, update: HistoryItemUpdate, now: u64) -> bool {
    let mut retag = false;

    if let Some(title) = update.title {
        retag |= title != item.item.title;
        item.item.title = title;
    }
    if let Some(content_type) = update.content_type {
        item.item.content_type = content_type;
    }
    if let Some(content) = update.content {
        if content != item.item.content {
            item.versions.push(VersionEntry {
                id: format!("ver-{}", uuid::Uuid::new_v4()),
                content: content.clone(),
                timestamp: now,
                change_note: update
                    .change_note
                    .unwrap_or_else(|| "Content updated".to_string()),
            });
            item.item.content = content;
            retag = true;
        }
    }
    if let Some(platform) = update.platform {
        item.item.platform = platform;
    }
    if let Some(tags) = update.tags {
        item.item.tags = tags;
    }
    if let Some(rating) = update.rating {
        item.item.rating = rating;
    }
    if let Some(starred) = update.starred {
        item.item.starred = starred;
    }
    if let Some(analytics) = update.analytics_data {
        item.analytics_data = analytics;
    }
    retag
}

fn reclassify(state: &mut StoreState) {
    let folders = &state.folders;
    for item in state.items.iter_mut() {
        item.smart_folders = classify(item, folders);
    }
}

/// Remove `item_id` from every group; groups left with fewer than two
/// members are dropped. Returns the ids of dropped groups.
fn prune_groups(groups: &mut Vec<DuplicateGroup>, item_id: &str) -> Vec<String> {
    let mut dropped = Vec::new();
    groups.retain_mut(|group| {
        group.items.retain(|i| i != item_id);
        if group.items.len() < 2 {
            dropped.push(group.id.clone());
            return false;
        }
        if group.consolidation_suggestion.keep_item == item_id {
            group.consolidation_suggestion.keep_item = group.items[0].clone();
        }
        true
    });
    dropped
}

fn parse_remote_list<T: DeserializeOwned>(raw: &str, what: &str) -> Option<Vec<T>> {
    match decode_list(raw) {
        Ok(list) => Some(list),
        Err(e) => {
            tracing::debug!("Dropping unparseable remote {}: {}", what, e);
            None
        }
    }
}

fn parse_remote<T: DeserializeOwned>(raw: &str, what: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("Dropping unparseable remote {}: {}", what, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::history::classify::FolderRules;
    use crate::history::similarity::DuplicateKind;
    use crate::history::tagging::KeywordTagger;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const START: u64 = 1_700_000_000_000;

    struct FailingTagger;

    impl Tagger for FailingTagger {
        fn tags(&self, _item: &HistoryItem) -> crate::Result<Vec<String>> {
            Err(crate::Error::Tagging("model unavailable".to_string()))
        }
    }

    fn context(storage: &MemoryStorage, clock: Arc<ManualClock>) -> StoreContext {
        StoreContext {
            storage: Arc::new(storage.handle()),
            clock,
            tagger: Arc::new(KeywordTagger::new(8).unwrap()),
            keys: StorageKeys::new("test"),
            duplicate_threshold: 0.8,
        }
    }

    async fn make_store() -> (HistoryStore, MemoryStorage, Arc<ManualClock>) {
        let storage = MemoryStorage::new();
        let clock = Arc::new(ManualClock::new(START));
        let store = HistoryStore::load(context(&storage, clock.clone())).await;
        (store, storage, clock)
    }

    fn video(id: &str, performance: f64) -> NewHistoryItem {
        NewHistoryItem {
            id: Some(id.to_string()),
            title: Some("Clip".to_string()),
            content_type: Some(ContentType::Video),
            content: Some(format!("video clip {}", id)),
            analytics_data: Some(AnalyticsData {
                performance,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bootstraps_default_folders() {
        let (store, storage, _) = make_store().await;
        let folders = store.smart_folders().await;
        assert_eq!(folders.len(), 3);
        assert!(storage.get("test.smart_folders").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_add_item_normalizes_missing_content() {
        let (store, _, _) = make_store().await;
        let item = store.add_item(NewHistoryItem::with_id("a")).await;

        assert_eq!(item.item.id, "a");
        assert_eq!(item.item.content, "");
        assert_eq!(item.item.rating, Rating::Unrated);
        assert_eq!(item.item.title, "Untitled");
        assert_eq!(item.item.timestamp, START);
        assert_eq!(item.versions.len(), 1);
        assert_eq!(item.versions[0].change_note, INITIAL_VERSION_NOTE);
    }

    #[tokio::test]
    async fn test_add_item_assigns_id() {
        let (store, _, _) = make_store().await;
        let item = store.add_item(NewHistoryItem::text("Hello", "world")).await;
        assert!(item.item.id.starts_with("item-"));
        assert!(store.get(&item.item.id).await.is_some());
    }

    #[tokio::test]
    async fn test_add_item_is_idempotent() {
        let (store, _, _) = make_store().await;
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = store.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let first = store.add_item(NewHistoryItem::text("T", "same body")).await;
        let mut again = NewHistoryItem::text("Other", "different body");
        again.id = Some(first.item.id.clone());
        let second = store.add_item(again).await;

        assert_eq!(first, second);
        assert_eq!(store.items().await.len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_item_classifies() {
        let (store, _, _) = make_store().await;
        let folder = store
            .create_smart_folder(NewSmartFolder {
                name: "Hot videos".to_string(),
                rules: FolderRules {
                    performance_min: Some(80.0),
                    content_types: Some(vec![ContentType::Video]),
                    ..Default::default()
                },
                auto_organize: true,
            })
            .await;

        let hot = store.add_item(video("hot", 85.0)).await;
        let cold = store.add_item(video("cold", 50.0)).await;

        assert!(hot.smart_folders.contains(&folder.id));
        assert!(!cold.smart_folders.contains(&folder.id));
        assert!(cold.smart_folders.contains(&"video-content".to_string()));

        let counted = store
            .smart_folders()
            .await
            .into_iter()
            .find(|f| f.id == folder.id)
            .unwrap();
        assert_eq!(counted.item_count, 1);
        assert_eq!(store.items_in_folder(&folder.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_new_folder_classifies_existing_items() {
        let (store, _, _) = make_store().await;
        store.add_item(NewHistoryItem::text("Recipe", "pasta sauce")).await;

        let folder = store
            .create_smart_folder(NewSmartFolder {
                name: "Food".to_string(),
                rules: FolderRules {
                    keywords: Some(vec!["PASTA".to_string()]),
                    ..Default::default()
                },
                auto_organize: true,
            })
            .await;
        assert_eq!(folder.item_count, 1);

        let manual = store
            .create_smart_folder(NewSmartFolder {
                name: "Manual".to_string(),
                rules: FolderRules::default(),
                auto_organize: false,
            })
            .await;
        assert_eq!(manual.item_count, 0);
    }

    #[tokio::test]
    async fn test_delete_smart_folder_strips_membership() {
        let (store, _, _) = make_store().await;
        store.add_item(video("v", 0.0)).await;
        assert!(store.delete_smart_folder("video-content").await);
        assert!(!store.delete_smart_folder("video-content").await);

        let item = store.get("v").await.unwrap();
        assert!(!item.smart_folders.contains(&"video-content".to_string()));
        assert_eq!(store.smart_folders().await.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_detection() {
        let (store, _, clock) = make_store().await;
        store
            .add_item(NewHistoryItem::text("A", "Buy our new coffee today"))
            .await;
        clock.advance(10);
        let dup = store
            .add_item(NewHistoryItem::text("B", "Buy our new coffee today"))
            .await;

        let groups = store.duplicate_groups().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kind, DuplicateKind::Exact);
        assert_eq!(dup.duplicate_group_id.as_deref(), Some(groups[0].id.as_str()));
        assert_eq!(groups[0].consolidation_suggestion.keep_item, dup.item.id);

        clock.advance(10);
        store
            .add_item(NewHistoryItem::text("C", "buy our new coffee today"))
            .await;
        let groups = store.duplicate_groups().await;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].kind, DuplicateKind::Similar);
    }

    #[tokio::test]
    async fn test_update_item_merges_and_versions() {
        let (store, _, clock) = make_store().await;
        store.add_item(NewHistoryItem::text("Draft", "first words")).await;
        let id = store.items().await[0].item.id.clone();

        clock.advance(5);
        let updated = store
            .update_item(&id, HistoryItemUpdate::content("second words", "Rewrite"))
            .await
            .unwrap();
        assert_eq!(updated.item.content, "second words");
        assert_eq!(updated.item.title, "Draft");
        assert_eq!(updated.versions.len(), 2);
        assert_eq!(updated.versions[1].change_note, "Rewrite");
        assert_eq!(updated.updated_at, START + 5);

        // Same content: no new version
        let again = store
            .update_item(&id, HistoryItemUpdate::content("second words", "noop"))
            .await
            .unwrap();
        assert_eq!(again.versions.len(), 2);

        assert!(store
            .update_item("missing", HistoryItemUpdate::default())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_update_reclassifies() {
        let (store, _, _) = make_store().await;
        store.add_item(video("v", 10.0)).await;
        let updated = store
            .update_item(
                "v",
                HistoryItemUpdate {
                    analytics_data: Some(AnalyticsData {
                        performance: 95.0,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.smart_folders.contains(&"high-performance".to_string()));
    }

    #[tokio::test]
    async fn test_rating_tri_state_notifies_each_time() {
        let (store, _, _) = make_store().await;
        store.add_item(NewHistoryItem::with_id("r")).await;

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = store.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        store.update_rating("r", Rating::Up).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("r").await.unwrap().item.rating, Rating::Up);

        store.update_rating("r", Rating::Unrated).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(store.get("r").await.unwrap().item.rating, Rating::Unrated);
    }

    #[tokio::test]
    async fn test_delete_item() {
        let (store, storage, clock) = make_store().await;
        store.add_item(NewHistoryItem::text("A", "same text here")).await;
        clock.advance(1);
        let b = store.add_item(NewHistoryItem::text("B", "same text here")).await;
        assert_eq!(store.duplicate_groups().await.len(), 1);

        clock.advance(1);
        assert!(store.delete_item(&b.item.id).await);
        assert!(!store.delete_item(&b.item.id).await);
        assert!(store.get(&b.item.id).await.is_none());
        // Group dropped below two members
        assert!(store.duplicate_groups().await.is_empty());

        let tombstones = storage.get("test.history_tombstones").await.unwrap().unwrap();
        assert!(tombstones.contains(&b.item.id));
    }

    #[tokio::test]
    async fn test_fallback_item_on_tagger_failure() {
        let storage = MemoryStorage::new();
        let clock = Arc::new(ManualClock::new(START));
        let mut ctx = context(&storage, clock);
        ctx.tagger = Arc::new(FailingTagger);
        let store = HistoryStore::load(ctx).await;

        let item = store.add_item(video("v", 99.0)).await;
        assert_eq!(item.item.id, "v");
        assert!(item.smart_folders.is_empty());
        assert!(item.versions.is_empty());
        assert_eq!(store.items().await.len(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_item_in_memory() {
        let (store, storage, _) = make_store().await;
        storage.set_quota_exceeded(true);

        let item = store.add_item(NewHistoryItem::text("T", "kept")).await;
        assert_eq!(store.items().await.len(), 1);
        assert_eq!(item.item.content, "kept");
        assert!(storage.get("test.history").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_history_loads_empty() {
        let storage = MemoryStorage::new();
        storage.set("test.history", "{{{").await.unwrap();
        let store = HistoryStore::load(context(&storage, Arc::new(ManualClock::new(START)))).await;
        assert!(store.items().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers_converge() {
        let storage = MemoryStorage::new();
        let clock = Arc::new(ManualClock::new(START));
        let r1 = HistoryStore::load(context(&storage, clock.clone())).await;
        let r2 = HistoryStore::load(context(&storage, clock.clone())).await;

        r1.add_item(NewHistoryItem::with_id("from-r1")).await;
        // r2 has not observed r1's write yet
        r2.add_item(NewHistoryItem::with_id("from-r2")).await;

        let stored: Vec<EnhancedHistoryItem> =
            serde_json::from_str(&storage.get("test.history").await.unwrap().unwrap()).unwrap();
        let ids: Vec<&str> = stored.iter().map(|i| i.item.id.as_str()).collect();
        assert!(ids.contains(&"from-r1"));
        assert!(ids.contains(&"from-r2"));
    }

    #[tokio::test]
    async fn test_apply_remote_history() {
        let storage = MemoryStorage::new();
        let clock = Arc::new(ManualClock::new(START));
        let r1 = HistoryStore::load(context(&storage, clock.clone())).await;
        let r2 = HistoryStore::load(context(&storage, clock.clone())).await;

        r1.add_item(NewHistoryItem::with_id("x")).await;
        let raw = storage.get("test.history").await.unwrap();

        assert!(r2.apply_remote_history(raw.as_deref()).await);
        assert!(!r2.apply_remote_history(raw.as_deref()).await);
        assert_eq!(r2.items().await.len(), 1);
        assert!(!r2.apply_remote_history(Some("garbage")).await);
    }

    #[tokio::test]
    async fn test_remote_tombstone_removes_item() {
        let storage = MemoryStorage::new();
        let clock = Arc::new(ManualClock::new(START));
        let r1 = HistoryStore::load(context(&storage, clock.clone())).await;
        let r2 = HistoryStore::load(context(&storage, clock.clone())).await;

        r1.add_item(NewHistoryItem::with_id("x")).await;
        r2.apply_remote_history(storage.get("test.history").await.unwrap().as_deref())
            .await;

        clock.advance(1);
        r1.delete_item("x").await;
        let raw = storage.get("test.history_tombstones").await.unwrap();
        assert!(r2.apply_remote_tombstones(raw.as_deref()).await);
        assert!(r2.items().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_history_defers_write() {
        let (store, storage, _) = make_store().await;
        storage.set("test.history", "{{{").await.unwrap();

        store.add_item(NewHistoryItem::with_id("local")).await;
        assert_eq!(store.items().await.len(), 1);
        // The unreadable list is left alone rather than replaced
        assert_eq!(storage.get("test.history").await.unwrap().as_deref(), Some("{{{"));
        assert_eq!(store.flush().await, 1);

        storage.set("test.history", "[]").await.unwrap();
        assert_eq!(store.flush().await, 0);
        let stored: Vec<EnhancedHistoryItem> =
            serde_json::from_str(&storage.get("test.history").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].item.id, "local");
    }

    #[tokio::test]
    async fn test_malformed_entries_do_not_wipe_history() {
        let storage = MemoryStorage::new();
        let clock = Arc::new(ManualClock::new(START));
        let r1 = HistoryStore::load(context(&storage, clock.clone())).await;
        let r2 = HistoryStore::load(context(&storage, clock.clone())).await;
        for id in ["a", "b", "c"] {
            let item = NewHistoryItem {
                id: Some(id.to_string()),
                ..NewHistoryItem::text(id, format!("note {}", id))
            };
            r1.add_item(item).await;
            clock.advance(1);
        }

        // Another writer nulls one item's content and appends junk
        let raw = storage.get("test.history").await.unwrap().unwrap();
        let mut doc: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        doc[0]["content"] = serde_json::Value::Null;
        doc.push(serde_json::json!("junk"));
        storage
            .set("test.history", &serde_json::to_string(&doc).unwrap())
            .await
            .unwrap();

        r2.add_item(NewHistoryItem::with_id("d")).await;

        let stored: Vec<EnhancedHistoryItem> =
            serde_json::from_str(&storage.get("test.history").await.unwrap().unwrap()).unwrap();
        let mut ids: Vec<&str> = stored.iter().map(|i| i.item.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert!(stored.iter().any(|i| i.item.content.is_empty()));
        assert_eq!(r2.items().await.len(), 4);
    }

    #[tokio::test]
    async fn test_readd_in_same_millisecond_revives_deleted_id() {
        let (store, storage, _) = make_store().await;
        store.add_item(NewHistoryItem::with_id("x")).await;
        assert!(store.delete_item("x").await);

        let again = store.add_item(NewHistoryItem::with_id("x")).await;
        assert!(again.updated_at > START);
        assert!(store.get("x").await.is_some());
        let raw = storage.get("test.history").await.unwrap().unwrap();
        assert!(raw.contains("\"id\":\"x\""));
    }
}
