//! Collaborator-facing service
//!
//! One [`HistoryService`] is one replica. It composes the history store,
//! the collection manager and the sync broadcaster over a shared storage
//! handle, routes storage change signals written by other replicas to the
//! right component, and runs the periodic sync compaction.

use crate::clock::Clock;
use crate::config::{HistoryConfig, StorageKeys};
use crate::error::Result;
use crate::history::{
    CollectionManager, ContentType, CustomCollection, DuplicateGroup, EnhancedHistoryItem,
    HistoryItemUpdate, HistoryStore, KeywordTagger, NewCollection, NewHistoryItem,
    NewSmartFolder, Rating, SmartFolder, StoreContext, Tagger,
};
use crate::storage::{SharedStorage, StorageChange};
use crate::subscription::Subscription;
use crate::sync::{
    BroadcasterContext, CanvasItem, EventPayload, ExportRecord, SyncBroadcaster, SyncEventType,
    TabContentEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Event target used by [`HistoryService::send_to_canvas`]
pub const CANVAS_TARGET: &str = "canvas";
/// Event target used by [`HistoryService::send_to_generator`]
pub const GENERATOR_TARGET: &str = "generator";
/// Event target used by [`HistoryService::send_to_calendar`]
pub const CALENDAR_TARGET: &str = "calendar";

/// One replica of the content history
pub struct HistoryService {
    storage: Arc<dyn SharedStorage>,
    clock: Arc<dyn Clock>,
    keys: StorageKeys,
    sync_interval: Duration,
    store: HistoryStore,
    collections: CollectionManager,
    sync: SyncBroadcaster,
}

/// Background tasks of a started service
pub struct ServiceHandle {
    watcher: JoinHandle<()>,
    compactor: JoinHandle<()>,
}

impl ServiceHandle {
    /// Stop listening for remote changes and stop compaction
    pub fn shutdown(self) {
        self.watcher.abort();
        self.compactor.abort();
        tracing::info!("Content history service stopped");
    }
}

impl HistoryService {
    /// Build a replica with the built-in keyword tagger
    pub async fn new(
        config: HistoryConfig,
        storage: Arc<dyn SharedStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let tagger = Arc::new(KeywordTagger::new(config.max_ai_tags)?);
        Self::with_tagger(config, storage, clock, tagger).await
    }

    /// Build a replica with a custom tagger
    pub async fn with_tagger(
        config: HistoryConfig,
        storage: Arc<dyn SharedStorage>,
        clock: Arc<dyn Clock>,
        tagger: Arc<dyn Tagger>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let keys = config.keys();
        let replica_id = config.resolved_replica_id();

        let store = HistoryStore::load(StoreContext {
            storage: Arc::clone(&storage),
            clock: Arc::clone(&clock),
            tagger,
            keys: keys.clone(),
            duplicate_threshold: config.duplicate_threshold,
        })
        .await;

        let collections = CollectionManager::load(
            Arc::clone(&storage),
            Arc::clone(&clock),
            keys.collections.clone(),
        )
        .await;

        let sync = SyncBroadcaster::load(BroadcasterContext {
            storage: Arc::clone(&storage),
            clock: Arc::clone(&clock),
            key: keys.sync.clone(),
            replica_id: replica_id.clone(),
            max_event_age_ms: config.max_event_age_ms,
            recent_list_cap: config.recent_list_cap,
        })
        .await;

        tracing::info!(
            replica_id = %replica_id,
            key_prefix = %config.key_prefix,
            "Content history service ready"
        );

        Ok(Arc::new(Self {
            storage,
            clock,
            keys,
            sync_interval: config.sync_interval(),
            store,
            collections,
            sync,
        }))
    }

    pub fn replica_id(&self) -> &str {
        self.sync.replica_id()
    }

    /// Spawn the remote-change listener and the timer that compacts the
    /// sync queue and retries deferred writes
    pub fn start(self: &Arc<Self>) -> ServiceHandle {
        let service = Arc::clone(self);
        let mut changes = self.storage.watch();
        let watcher = tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                service.handle_storage_change(&change).await;
            }
            tracing::info!("Storage change stream closed");
        });

        let service = Arc::clone(self);
        let compactor = tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.sync_interval);
            loop {
                interval.tick().await;
                service.sync.tick().await;
                service.store.flush().await;
                service.collections.flush().await;
            }
        });

        tracing::info!(replica_id = %self.replica_id(), "Content history service started");
        ServiceHandle { watcher, compactor }
    }

    // =========================================================================
    // History
    // =========================================================================

    pub async fn add_history_item(&self, item: NewHistoryItem) -> EnhancedHistoryItem {
        self.store.add_item(item).await
    }

    pub async fn update_history_item(
        &self,
        id: &str,
        update: HistoryItemUpdate,
    ) -> Option<EnhancedHistoryItem> {
        let payload_content = update.content.clone();
        let updated = self.store.update_item(id, update).await?;
        let payload = EventPayload {
            content: payload_content,
            title: Some(updated.item.title.clone()),
            ..EventPayload::for_item(id)
        };
        self.sync
            .broadcast(SyncEventType::ContentEdited, payload, None)
            .await;
        Some(updated)
    }

    pub async fn update_rating(&self, id: &str, rating: Rating) -> Option<EnhancedHistoryItem> {
        let updated = self.store.update_rating(id, rating).await?;
        let mut payload = EventPayload::for_item(id);
        payload
            .metadata
            .insert("rating".to_string(), serde_json::json!(rating.as_i8()));
        self.sync
            .broadcast(SyncEventType::ContentEdited, payload, None)
            .await;
        Some(updated)
    }

    pub async fn delete_history_item(&self, id: &str) -> bool {
        if !self.store.delete_item(id).await {
            return false;
        }
        self.sync
            .broadcast(SyncEventType::ContentDeleted, EventPayload::for_item(id), None)
            .await;
        true
    }

    pub async fn get_enhanced_history(&self) -> Vec<EnhancedHistoryItem> {
        self.store.items().await
    }

    pub async fn get_item(&self, id: &str) -> Option<EnhancedHistoryItem> {
        self.store.get(id).await
    }

    pub async fn duplicate_groups(&self) -> Vec<DuplicateGroup> {
        self.store.duplicate_groups().await
    }

    /// Listen for full-list updates of the history
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Vec<EnhancedHistoryItem>) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    // =========================================================================
    // Smart folders
    // =========================================================================

    pub async fn get_smart_folders(&self) -> Vec<SmartFolder> {
        self.store.smart_folders().await
    }

    pub async fn create_smart_folder(&self, folder: NewSmartFolder) -> SmartFolder {
        self.store.create_smart_folder(folder).await
    }

    pub async fn delete_smart_folder(&self, folder_id: &str) -> bool {
        self.store.delete_smart_folder(folder_id).await
    }

    pub async fn items_in_folder(&self, folder_id: &str) -> Vec<EnhancedHistoryItem> {
        self.store.items_in_folder(folder_id).await
    }

    // =========================================================================
    // Collections
    // =========================================================================

    pub async fn get_custom_collections(&self) -> Vec<CustomCollection> {
        self.collections.collections().await
    }

    pub async fn create_custom_collection(&self, collection: NewCollection) -> CustomCollection {
        self.collections.create_collection(collection).await
    }

    /// Add an item to a collection and record the membership on the item
    pub async fn add_to_collection(&self, collection_id: &str, item_id: &str) -> bool {
        if !self.collections.add_to_collection(collection_id, item_id).await {
            return false;
        }
        self.store
            .set_collection_membership(item_id, collection_id, true)
            .await;
        true
    }

    pub async fn remove_from_collection(&self, collection_id: &str, item_id: &str) -> bool {
        if !self
            .collections
            .remove_from_collection(collection_id, item_id)
            .await
        {
            return false;
        }
        self.store
            .set_collection_membership(item_id, collection_id, false)
            .await;
        true
    }

    pub async fn delete_collection(&self, collection_id: &str) -> bool {
        if !self.collections.delete_collection(collection_id).await {
            return false;
        }
        self.store.strip_collection(collection_id).await;
        true
    }

    /// Live items of a collection; deleted items are skipped
    pub async fn collection_items(&self, collection_id: &str) -> Vec<EnhancedHistoryItem> {
        let history = self.store.items().await;
        self.collections.resolve_items(collection_id, &history).await
    }

    // =========================================================================
    // Cross-replica events
    // =========================================================================

    /// Listen for sync events of one type, or every event with `"*"`
    pub fn subscribe_sync<F>(&self, event_type: &str, listener: F) -> Subscription
    where
        F: Fn(&TabContentEvent) + Send + Sync + 'static,
    {
        self.sync.subscribe(event_type, listener)
    }

    /// Record generated content and announce it. Returns the item id.
    pub async fn track_content_generation(
        &self,
        source_replica: &str,
        content: NewHistoryItem,
    ) -> String {
        let metadata = content.metadata.clone();
        let item = self.store.add_item(content).await;
        let payload = EventPayload {
            content: Some(item.item.content.clone()),
            title: Some(item.item.title.clone()),
            content_type: Some(item.item.content_type),
            platform: Some(item.item.platform.clone()),
            metadata,
            ..EventPayload::for_item(&item.item.id)
        };
        self.sync
            .broadcast_as(source_replica, SyncEventType::ContentGenerated, payload, None)
            .await;
        item.item.id
    }

    /// Ask the canvas to show an item
    pub async fn send_to_canvas(&self, history_item_id: &str) -> TabContentEvent {
        let mut payload = EventPayload {
            canvas_item_id: Some(format!("canvas-{}", uuid::Uuid::new_v4())),
            ..EventPayload::for_item(history_item_id)
        };
        if let Some(item) = self.store.get(history_item_id).await {
            payload.content = Some(item.item.content);
            payload.title = Some(item.item.title);
            payload.content_type = Some(item.item.content_type);
        }
        self.sync
            .broadcast(SyncEventType::CanvasUpdated, payload, Some(CANVAS_TARGET))
            .await
    }

    /// Ask the generator to produce content from a prompt
    pub async fn send_to_generator(
        &self,
        prompt: &str,
        content_type: ContentType,
    ) -> TabContentEvent {
        let payload = EventPayload {
            content: Some(prompt.to_string()),
            content_type: Some(content_type),
            ..Default::default()
        };
        self.sync
            .broadcast(SyncEventType::ContentGenerated, payload, Some(GENERATOR_TARGET))
            .await
    }

    /// Hand content to the calendar
    pub async fn send_to_calendar(&self, content_data: EventPayload) -> TabContentEvent {
        self.sync
            .broadcast(SyncEventType::ExportCompleted, content_data, Some(CALENDAR_TARGET))
            .await
    }

    /// Announce a finished export of an item
    pub async fn record_export(&self, history_item_id: &str, target: &str) -> TabContentEvent {
        self.sync
            .broadcast(
                SyncEventType::ExportCompleted,
                EventPayload::for_item(history_item_id),
                Some(target),
            )
            .await
    }

    pub async fn pending_events(&self) -> Vec<TabContentEvent> {
        self.sync.pending_events().await
    }

    pub async fn canvas_items(&self) -> Vec<CanvasItem> {
        self.sync.canvas_items().await
    }

    pub async fn recent_exports(&self) -> Vec<ExportRecord> {
        self.sync.recent_exports().await
    }

    /// Prune expired events now. Returns how many were removed.
    pub async fn compact_now(&self) -> usize {
        self.sync.tick().await
    }

    // =========================================================================
    // Remote changes
    // =========================================================================

    /// Apply a change another replica wrote. Returns true when local state
    /// changed (or, for the sync key, when new events were dispatched).
    pub async fn handle_storage_change(&self, change: &StorageChange) -> bool {
        let raw = change.new_value.as_deref();
        let key = change.key.as_str();
        let keys = &self.keys;

        let changed = if key == keys.history {
            self.store.apply_remote_history(raw).await
        } else if key == keys.tombstones {
            self.store.apply_remote_tombstones(raw).await
        } else if key == keys.smart_folders {
            self.store.apply_remote_folders(raw).await
        } else if key == keys.collections {
            self.collections.apply_remote(raw).await
        } else if key == keys.duplicate_groups {
            self.store.apply_remote_groups(raw).await
        } else if key == keys.sync {
            self.sync.apply_remote(raw).await > 0
        } else {
            tracing::trace!(key, "Ignoring change to unrelated key");
            return false;
        };

        tracing::debug!(key, origin = %change.origin, changed, "Applied remote storage change");
        changed
    }

    /// Current time on this replica's clock
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}
