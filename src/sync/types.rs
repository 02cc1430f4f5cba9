//! Cross-replica sync wire types
//!
//! Everything here is persisted under the sync key as one `SyncState`
//! document with camelCase field names.

use crate::history::merge::Identified;
use crate::history::types::ContentType;
use crate::storage::document::decode_entries;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    ContentGenerated,
    ContentEdited,
    ContentDeleted,
    CanvasUpdated,
    ExportCompleted,
}

impl SyncEventType {
    /// Channel name listeners subscribe to
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContentGenerated => "content_generated",
            Self::ContentEdited => "content_edited",
            Self::ContentDeleted => "content_deleted",
            Self::CanvasUpdated => "canvas_updated",
            Self::ExportCompleted => "export_completed",
        }
    }
}

impl std::fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for SyncEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content_generated" => Ok(Self::ContentGenerated),
            "content_edited" => Ok(Self::ContentEdited),
            "content_deleted" => Ok(Self::ContentDeleted),
            "canvas_updated" => Ok(Self::CanvasUpdated),
            "export_completed" => Ok(Self::ExportCompleted),
            other => Err(format!("unknown sync event type: {}", other)),
        }
    }
}

/// Loosely typed event body; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canvas_item_id: Option<String>,
}

impl EventPayload {
    pub fn for_item(history_item_id: impl Into<String>) -> Self {
        Self {
            history_item_id: Some(history_item_id.into()),
            ..Default::default()
        }
    }
}

/// Sync envelope for one locally originated change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabContentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: SyncEventType,
    pub source_replica: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_replica: Option<String>,
    /// 0 means unknown; normalized to the receiver's clock on ingest
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub payload: EventPayload,
}

/// An item placed on the canvas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_item_id: Option<String>,
    pub added_at: u64,
}

/// A completed export, keyed by the event that announced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_item_id: Option<String>,
    pub exported_at: u64,
}

/// Document stored under the sync key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncState {
    pub pending_sync: Vec<TabContentEvent>,
    pub recent_exports: Vec<ExportRecord>,
    pub canvas_items: Vec<CanvasItem>,
    /// Time of the write
    pub timestamp: u64,
}

/// `SyncState` with its lists still undecoded
#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawSyncState {
    pending_sync: Vec<serde_json::Value>,
    recent_exports: Vec<serde_json::Value>,
    canvas_items: Vec<serde_json::Value>,
    timestamp: u64,
}

impl SyncState {
    /// Decode a stored document, dropping malformed list entries. Fails
    /// only when the document itself is not a sync state object.
    pub fn decode(raw: &str) -> crate::Result<Self> {
        let raw: RawSyncState = serde_json::from_str(raw)?;
        Ok(Self {
            pending_sync: decode_entries(raw.pending_sync),
            recent_exports: decode_entries(raw.recent_exports),
            canvas_items: decode_entries(raw.canvas_items),
            timestamp: raw.timestamp,
        })
    }
}

impl Identified for TabContentEvent {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for CanvasItem {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for ExportRecord {
    fn id(&self) -> &str {
        &self.event_id
    }
}
