//! Sync broadcaster: cross-replica event propagation
//!
//! Local changes are wrapped in a [`TabContentEvent`], appended to the
//! pending queue and written to the sync key. The write itself is the
//! notification: every other replica sees the change signal, ingests the
//! events it does not know by id and dispatches them as if they were local.
//! Events live for `max_event_age` and are then pruned independently by
//! every replica.
//!
//! Every write of the queue also adopts the stored events this replica has
//! not seen yet. The merged document is what gets written, so a peer's
//! event may never produce a change signal of its own.

use super::types::*;
use crate::clock::Clock;
use crate::history::merge::union_by_id;
use crate::storage::document::write_document;
use crate::storage::SharedStorage;
use crate::subscription::{Subscription, SubscriptionRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared dependencies and tunables of a broadcaster
pub struct BroadcasterContext {
    pub storage: Arc<dyn SharedStorage>,
    pub clock: Arc<dyn Clock>,
    pub key: String,
    pub replica_id: String,
    pub max_event_age_ms: u64,
    pub recent_list_cap: usize,
}

#[derive(Default)]
struct SyncQueue {
    state: SyncState,
    /// Local changes not yet written
    dirty: bool,
}

/// Pending-event queue of one replica plus its event listeners
pub struct SyncBroadcaster {
    ctx: BroadcasterContext,
    queue: RwLock<SyncQueue>,
    listeners: SubscriptionRegistry<TabContentEvent>,
}

impl SyncBroadcaster {
    /// Load the stored queue. Events already stored count as seen and are
    /// not dispatched again.
    pub async fn load(ctx: BroadcasterContext) -> Self {
        let now = ctx.clock.now_millis();
        let mut state = read_state(ctx.storage.as_ref(), &ctx.key)
            .await
            .unwrap_or_default();
        state
            .pending_sync
            .retain(|e| !is_expired(e.timestamp, now, ctx.max_event_age_ms));

        tracing::debug!(
            replica_id = %ctx.replica_id,
            pending = state.pending_sync.len(),
            "Sync broadcaster loaded"
        );

        Self {
            ctx,
            queue: RwLock::new(SyncQueue {
                state,
                dirty: false,
            }),
            listeners: SubscriptionRegistry::new(),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.ctx.replica_id
    }

    /// Listen for events of one type, or every event with `"*"`
    pub fn subscribe<F>(&self, channel: &str, listener: F) -> Subscription
    where
        F: Fn(&TabContentEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(channel, listener)
    }

    /// Publish a local change: queue it, persist the queue, dispatch it
    pub async fn broadcast(
        &self,
        event_type: SyncEventType,
        payload: EventPayload,
        target: Option<&str>,
    ) -> TabContentEvent {
        let source = self.ctx.replica_id.clone();
        self.broadcast_as(&source, event_type, payload, target).await
    }

    /// Like [`broadcast`](Self::broadcast) with an explicit source replica
    pub async fn broadcast_as(
        &self,
        source_replica: &str,
        event_type: SyncEventType,
        payload: EventPayload,
        target: Option<&str>,
    ) -> TabContentEvent {
        let event = TabContentEvent {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type,
            source_replica: source_replica.to_string(),
            target_replica: target.map(str::to_string),
            timestamp: self.ctx.clock.now_millis(),
            payload,
        };

        let adopted = {
            let mut queue = self.queue.write().await;
            queue.state.pending_sync.push(event.clone());
            self.record(&mut queue.state, &event);
            self.persist(&mut queue).await
        };

        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Broadcast sync event");
        self.dispatch(&event);
        self.replay(&adopted);
        event
    }

    /// Accept the unseen, unexpired events of a remote sync document.
    ///
    /// Returns the accepted events in arrival order; they are not
    /// dispatched. Unparseable documents are dropped.
    pub async fn ingest(&self, raw: &str) -> Vec<TabContentEvent> {
        let remote = match SyncState::decode(raw) {
            Ok(remote) => remote,
            Err(e) => {
                tracing::debug!("Dropping unparseable sync payload: {}", e);
                return Vec::new();
            }
        };
        let mut queue = self.queue.write().await;
        self.adopt(&mut queue.state, remote)
    }

    /// Ingest a remote document and dispatch what was accepted. Returns how
    /// many events were new.
    pub async fn apply_remote(&self, raw: Option<&str>) -> usize {
        let Some(raw) = raw else {
            return 0;
        };
        let accepted = self.ingest(raw).await;
        self.replay(&accepted);
        accepted.len()
    }

    /// Drop expired events. Returns how many were removed.
    pub async fn compact(&self, now: u64) -> usize {
        let mut queue = self.queue.write().await;
        let before = queue.state.pending_sync.len();
        let max_age = self.ctx.max_event_age_ms;
        queue
            .state
            .pending_sync
            .retain(|e| !is_expired(e.timestamp, now, max_age));
        before - queue.state.pending_sync.len()
    }

    /// Periodic duty: compact, then re-persist when anything changed
    pub async fn tick(&self) -> usize {
        let pruned = self.compact(self.ctx.clock.now_millis()).await;
        let adopted = {
            let mut queue = self.queue.write().await;
            if pruned == 0 && !queue.dirty {
                return 0;
            }
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned expired sync events");
            }
            self.persist(&mut queue).await
        };
        self.replay(&adopted);
        pruned
    }

    pub async fn pending_events(&self) -> Vec<TabContentEvent> {
        self.queue.read().await.state.pending_sync.clone()
    }

    pub async fn canvas_items(&self) -> Vec<CanvasItem> {
        self.queue.read().await.state.canvas_items.clone()
    }

    pub async fn recent_exports(&self) -> Vec<ExportRecord> {
        self.queue.read().await.state.recent_exports.clone()
    }

    fn dispatch(&self, event: &TabContentEvent) {
        self.listeners
            .emit_with_wildcard(event.event_type.as_str(), event);
    }

    /// Dispatch events that came from other replicas
    fn replay(&self, events: &[TabContentEvent]) {
        for event in events {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                source = %event.source_replica,
                "Replaying remote sync event"
            );
            self.dispatch(event);
        }
    }

    /// Take in the unseen, unexpired events of `remote` along with its
    /// canvas and export lists. Returns the accepted events in arrival order.
    fn adopt(&self, state: &mut SyncState, remote: SyncState) -> Vec<TabContentEvent> {
        let now = self.ctx.clock.now_millis();
        let mut known: HashSet<String> = state.pending_sync.iter().map(|e| e.id.clone()).collect();

        let mut accepted = Vec::new();
        for mut event in remote.pending_sync {
            if known.contains(&event.id) {
                continue;
            }
            if event.timestamp == 0 || event.timestamp > now {
                event.timestamp = now;
            }
            if is_expired(event.timestamp, now, self.ctx.max_event_age_ms) {
                continue;
            }
            known.insert(event.id.clone());
            state.pending_sync.push(event.clone());
            accepted.push(event);
        }

        state.canvas_items =
            self.capped(union_by_id(&state.canvas_items, &remote.canvas_items, |_, _| false));
        state.recent_exports = self.capped(union_by_id(
            &state.recent_exports,
            &remote.recent_exports,
            |_, _| false,
        ));
        for event in &accepted {
            self.record(state, event);
        }

        accepted
    }

    /// Track canvas placements and exports carried by an event
    fn record(&self, state: &mut SyncState, event: &TabContentEvent) {
        match event.event_type {
            SyncEventType::CanvasUpdated => {
                let Some(canvas_id) = event.payload.canvas_item_id.as_ref() else {
                    return;
                };
                if state.canvas_items.iter().any(|c| &c.id == canvas_id) {
                    return;
                }
                state.canvas_items.push(CanvasItem {
                    id: canvas_id.clone(),
                    history_item_id: event.payload.history_item_id.clone(),
                    added_at: event.timestamp,
                });
                state.canvas_items = self.capped(std::mem::take(&mut state.canvas_items));
            }
            SyncEventType::ExportCompleted => {
                if state.recent_exports.iter().any(|r| r.event_id == event.id) {
                    return;
                }
                state.recent_exports.push(ExportRecord {
                    event_id: event.id.clone(),
                    target: event.target_replica.clone(),
                    history_item_id: event.payload.history_item_id.clone(),
                    exported_at: event.timestamp,
                });
                state.recent_exports = self.capped(std::mem::take(&mut state.recent_exports));
            }
            _ => {}
        }
    }

    /// Keep the newest `recent_list_cap` entries
    fn capped<T>(&self, mut list: Vec<T>) -> Vec<T> {
        let cap = self.ctx.recent_list_cap;
        if list.len() > cap {
            list.drain(..list.len() - cap);
        }
        list
    }

    /// Read-merge-write of the sync document. Stored events this replica
    /// has not seen are adopted into the queue and returned; the caller
    /// dispatches them once the queue lock is released.
    async fn persist(&self, queue: &mut SyncQueue) -> Vec<TabContentEvent> {
        let storage = self.ctx.storage.as_ref();
        let stored = match storage.get(&self.ctx.key).await {
            Ok(Some(raw)) => SyncState::decode(&raw).unwrap_or_else(|e| {
                // Nothing in it can be recovered and every event expires anyway
                tracing::warn!(key = %self.ctx.key, "Replacing unparseable sync state: {}", e);
                SyncState::default()
            }),
            Ok(None) => SyncState::default(),
            Err(e) => {
                tracing::warn!(key = %self.ctx.key, "Failed to read sync state, deferring write: {}", e);
                queue.dirty = true;
                return Vec::new();
            }
        };
        let adopted = self.adopt(&mut queue.state, stored);
        if !adopted.is_empty() {
            tracing::debug!(adopted = adopted.len(), "Adopted stored sync events");
        }

        let now = self.ctx.clock.now_millis();
        let max_age = self.ctx.max_event_age_ms;
        let mut pending = queue.state.pending_sync.clone();
        pending.retain(|e| !is_expired(e.timestamp, now, max_age));
        pending.sort_by_key(|e| e.timestamp);

        let document = SyncState {
            pending_sync: pending,
            recent_exports: queue.state.recent_exports.clone(),
            canvas_items: queue.state.canvas_items.clone(),
            timestamp: now,
        };

        if write_document(storage, &self.ctx.key, &document).await {
            queue.state.timestamp = now;
            queue.dirty = false;
        } else {
            queue.dirty = true;
        }
        adopted
    }
}

/// An event exactly `max_age` old is still live
fn is_expired(timestamp: u64, now: u64, max_age: u64) -> bool {
    now.saturating_sub(timestamp) > max_age
}

async fn read_state(storage: &dyn SharedStorage, key: &str) -> Option<SyncState> {
    let decoded = match storage.get(key).await {
        Ok(raw) => raw.map(|raw| SyncState::decode(&raw)).transpose(),
        Err(e) => Err(e),
    };
    decoded.unwrap_or_else(|e| {
        tracing::warn!(key, "Failed to read sync state: {}", e);
        None
    })
}
