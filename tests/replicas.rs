//! Two replicas over one shared medium

use content_history::clock::ManualClock;
use content_history::config::HistoryConfig;
use content_history::history::{
    AnalyticsData, ContentType, DuplicateKind, EnhancedHistoryItem, FolderRules, NewHistoryItem,
    NewSmartFolder, Rating,
};
use content_history::storage::{FileStorage, MemoryStorage, SharedStorage, StorageChange};
use content_history::sync::{EventPayload, SyncEventType};
use content_history::HistoryService;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const START: u64 = 1_707_753_600_000;
const MINUTE: u64 = 60_000;

fn config(replica: &str) -> HistoryConfig {
    HistoryConfig {
        replica_id: replica.to_string(),
        ..Default::default()
    }
}

async fn replica(
    storage: &MemoryStorage,
    clock: &Arc<ManualClock>,
    id: &str,
) -> Arc<HistoryService> {
    HistoryService::new(config(id), Arc::new(storage.handle()), clock.clone())
        .await
        .unwrap()
}

/// What the medium would signal to other replicas for `key`
async fn signal(storage: &MemoryStorage, key: &str) -> StorageChange {
    StorageChange {
        key: key.to_string(),
        new_value: storage.get(key).await.unwrap(),
        origin: "peer".to_string(),
    }
}

#[tokio::test]
async fn test_item_visible_on_other_replica_exactly_once() {
    let storage = MemoryStorage::new();
    let clock = Arc::new(ManualClock::new(START));
    let r1 = replica(&storage, &clock, "r1").await;
    let r2 = replica(&storage, &clock, "r2").await;

    let x = r1.add_history_item(NewHistoryItem::text("X", "cross replica")).await;

    let change = signal(&storage, "content_history.history").await;
    assert!(r2.handle_storage_change(&change).await);
    // Delivered twice: still one copy
    r2.handle_storage_change(&change).await;

    let history = r2.get_enhanced_history().await;
    assert_eq!(history.iter().filter(|i| i.item.id == x.item.id).count(), 1);
}

#[tokio::test]
async fn test_sync_event_replayed_once() {
    let storage = MemoryStorage::new();
    let clock = Arc::new(ManualClock::new(START));
    let r1 = replica(&storage, &clock, "r1").await;
    let r2 = replica(&storage, &clock, "r2").await;

    let typed = Arc::new(AtomicUsize::new(0));
    let all = Arc::new(AtomicUsize::new(0));
    let (t, a) = (typed.clone(), all.clone());
    let _s1 = r2.subscribe_sync("canvas_updated", move |_| {
        t.fetch_add(1, Ordering::SeqCst);
    });
    let _s2 = r2.subscribe_sync("*", move |_| {
        a.fetch_add(1, Ordering::SeqCst);
    });

    let event = r1.send_to_canvas("item-1").await;
    let change = signal(&storage, "content_history.sync").await;
    r2.handle_storage_change(&change).await;
    r2.handle_storage_change(&change).await;

    assert_eq!(typed.load(Ordering::SeqCst), 1);
    assert_eq!(all.load(Ordering::SeqCst), 1);
    let pending = r2.pending_events().await;
    assert_eq!(pending.iter().filter(|e| e.id == event.id).count(), 1);
    assert_eq!(r2.canvas_items().await.len(), 1);
}

#[tokio::test]
async fn test_pruning_window() {
    let storage = MemoryStorage::new();
    let clock = Arc::new(ManualClock::new(START));
    let r1 = replica(&storage, &clock, "r1").await;

    r1.send_to_generator("first", ContentType::Text).await;
    clock.advance(2 * MINUTE);
    r1.send_to_generator("second", ContentType::Text).await;

    // First is 61 minutes old, second 59
    clock.advance(59 * MINUTE);
    assert_eq!(r1.compact_now().await, 1);
    let remaining: Vec<Option<String>> = r1
        .pending_events()
        .await
        .into_iter()
        .map(|e| e.payload.content)
        .collect();
    assert_eq!(remaining, vec![Some("second".to_string())]);
}

#[tokio::test]
async fn test_rating_tri_state() {
    let storage = MemoryStorage::new();
    let clock = Arc::new(ManualClock::new(START));
    let r1 = replica(&storage, &clock, "r1").await;
    let item = r1.add_history_item(NewHistoryItem::with_id("rated")).await;

    let notified = Arc::new(AtomicUsize::new(0));
    let n = notified.clone();
    let _sub = r1.subscribe(move |_| {
        n.fetch_add(1, Ordering::SeqCst);
    });

    r1.update_rating(&item.item.id, Rating::Up).await;
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    r1.update_rating(&item.item.id, Rating::Unrated).await;
    assert_eq!(notified.load(Ordering::SeqCst), 2);

    let stored = r1.get_item("rated").await.unwrap();
    assert_eq!(stored.item.rating, Rating::Unrated);
    assert_eq!(stored.item.content, "");
}

#[tokio::test]
async fn test_concurrent_adds_converge() {
    let storage = MemoryStorage::new();
    let clock = Arc::new(ManualClock::new(START));
    let r1 = replica(&storage, &clock, "r1").await;
    let r2 = replica(&storage, &clock, "r2").await;

    // Neither replica has observed the other's write
    r1.add_history_item(NewHistoryItem::with_id("one")).await;
    clock.advance(1);
    r2.add_history_item(NewHistoryItem::with_id("two")).await;

    let change = signal(&storage, "content_history.history").await;
    r1.handle_storage_change(&change).await;
    r2.handle_storage_change(&change).await;

    let ids = |items: Vec<EnhancedHistoryItem>| -> Vec<String> {
        items.into_iter().map(|i| i.item.id).collect()
    };
    let one = ids(r1.get_enhanced_history().await);
    let two = ids(r2.get_enhanced_history().await);
    assert_eq!(one, vec!["two", "one"]);
    assert_eq!(one, two);
}

#[tokio::test]
async fn test_delete_does_not_resurrect() {
    let storage = MemoryStorage::new();
    let clock = Arc::new(ManualClock::new(START));
    let r1 = replica(&storage, &clock, "r1").await;
    let r2 = replica(&storage, &clock, "r2").await;

    r1.add_history_item(NewHistoryItem::with_id("doomed")).await;
    r2.handle_storage_change(&signal(&storage, "content_history.history").await)
        .await;
    assert!(r2.get_item("doomed").await.is_some());

    clock.advance(10);
    assert!(r1.delete_history_item("doomed").await);

    // r2 writes its stale view before seeing the deletion
    r2.add_history_item(NewHistoryItem::with_id("other")).await;
    assert!(r2.get_item("doomed").await.is_none());

    r1.handle_storage_change(&signal(&storage, "content_history.history").await)
        .await;
    assert!(r1.get_item("doomed").await.is_none());
    assert!(r1.get_item("other").await.is_some());
}

#[tokio::test]
async fn test_folders_and_duplicates_across_replicas() {
    let storage = MemoryStorage::new();
    let clock = Arc::new(ManualClock::new(START));
    let r1 = replica(&storage, &clock, "r1").await;
    let r2 = replica(&storage, &clock, "r2").await;

    let folder = r1
        .create_smart_folder(NewSmartFolder {
            name: "Top videos".to_string(),
            rules: FolderRules {
                performance_min: Some(80.0),
                content_types: Some(vec![ContentType::Video]),
                ..Default::default()
            },
            auto_organize: true,
        })
        .await;
    r2.handle_storage_change(&signal(&storage, "content_history.smart_folders").await)
        .await;

    let video = |id: &str, performance: f64| NewHistoryItem {
        id: Some(id.to_string()),
        content_type: Some(ContentType::Video),
        content: Some("launch teaser for the spring drop".to_string()),
        analytics_data: Some(AnalyticsData {
            performance,
            ..Default::default()
        }),
        ..Default::default()
    };

    let hot = r2.add_history_item(video("hot", 85.0)).await;
    clock.advance(1);
    let cold = r2.add_history_item(video("cold", 50.0)).await;
    assert!(hot.smart_folders.contains(&folder.id));
    assert!(!cold.smart_folders.contains(&folder.id));

    let groups = r2.duplicate_groups().await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].kind, DuplicateKind::Exact);

    r1.handle_storage_change(&signal(&storage, "content_history.duplicate_groups").await)
        .await;
    assert_eq!(r1.duplicate_groups().await, groups);
}

#[tokio::test]
async fn test_calendar_export_visible_to_peer() {
    let storage = MemoryStorage::new();
    let clock = Arc::new(ManualClock::new(START));
    let r1 = replica(&storage, &clock, "r1").await;
    let r2 = replica(&storage, &clock, "r2").await;

    let exports = Arc::new(AtomicUsize::new(0));
    let e = exports.clone();
    let _sub = r2.subscribe_sync(SyncEventType::ExportCompleted.as_str(), move |_| {
        e.fetch_add(1, Ordering::SeqCst);
    });

    r1.send_to_calendar(EventPayload {
        title: Some("Post on Friday".to_string()),
        ..Default::default()
    })
    .await;
    r2.handle_storage_change(&signal(&storage, "content_history.sync").await)
        .await;

    assert_eq!(exports.load(Ordering::SeqCst), 1);
    assert_eq!(r2.recent_exports().await.len(), 1);
}

#[tokio::test]
async fn test_file_replicas_sync_through_watcher() {
    let dir = tempfile::TempDir::new().unwrap();
    let poll = Duration::from_millis(20);
    let s1 = FileStorage::open(dir.path().to_path_buf(), poll).await.unwrap();
    let s2 = FileStorage::open(dir.path().to_path_buf(), poll).await.unwrap();

    let r1 = HistoryService::new(config("f1"), Arc::new(s1), Arc::new(ManualClock::new(START)))
        .await
        .unwrap();
    let r2 = HistoryService::new(config("f2"), Arc::new(s2), Arc::new(ManualClock::new(START)))
        .await
        .unwrap();
    let handle = r2.start();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = r2.subscribe(move |items| {
        let _ = tx.send(items.len());
    });

    r1.add_history_item(NewHistoryItem::text("From disk", "written by f1"))
        .await;

    let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, 1);
    assert_eq!(r2.get_enhanced_history().await.len(), 1);

    handle.shutdown();
}

#[tokio::test]
async fn test_file_replica_keeps_peer_event_written_before_its_own() {
    let dir = tempfile::TempDir::new().unwrap();
    let poll = Duration::from_millis(20);
    let s1 = FileStorage::open(dir.path().to_path_buf(), poll).await.unwrap();
    let s2 = FileStorage::open(dir.path().to_path_buf(), poll).await.unwrap();
    let clock = Arc::new(ManualClock::new(START));

    let r1 = HistoryService::new(config("f1"), Arc::new(s1), clock.clone())
        .await
        .unwrap();
    let r2 = HistoryService::new(config("f2"), Arc::new(s2), clock.clone())
        .await
        .unwrap();

    let exports = Arc::new(AtomicUsize::new(0));
    let e = exports.clone();
    let _sub = r2.subscribe_sync(SyncEventType::ExportCompleted.as_str(), move |_| {
        e.fetch_add(1, Ordering::SeqCst);
    });

    let e1 = r1.send_to_calendar(EventPayload::default()).await;
    // r2 writes the sync document before its watcher ever polls
    r2.send_to_generator("draft", ContentType::Text).await;

    assert_eq!(exports.load(Ordering::SeqCst), 1);
    assert!(r2.pending_events().await.iter().any(|e| e.id == e1.id));

    let handle = r2.start();
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown();
    assert_eq!(exports.load(Ordering::SeqCst), 1);
    assert_eq!(r2.recent_exports().await.len(), 1);
}

#[tokio::test]
async fn test_peer_with_malformed_entry_does_not_wipe_history() {
    let storage = MemoryStorage::new();
    let clock = Arc::new(ManualClock::new(START));
    let r1 = replica(&storage, &clock, "r1").await;
    let r2 = replica(&storage, &clock, "r2").await;

    for id in ["a", "b", "c"] {
        r1.add_history_item(NewHistoryItem::with_id(id)).await;
        clock.advance(1);
    }
    let key = "content_history.history";
    let raw = storage.get(key).await.unwrap().unwrap();
    let mut doc: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
    doc[1]["content"] = serde_json::Value::Null;
    storage.set(key, &serde_json::to_string(&doc).unwrap()).await.unwrap();

    r2.add_history_item(NewHistoryItem::with_id("d")).await;

    let stored: Vec<serde_json::Value> =
        serde_json::from_str(&storage.get(key).await.unwrap().unwrap()).unwrap();
    assert_eq!(stored.len(), 4);
    r1.handle_storage_change(&signal(&storage, key).await).await;
    assert_eq!(r1.get_enhanced_history().await.len(), 4);
}
