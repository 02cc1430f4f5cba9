//! Cross-replica event propagation

pub mod broadcaster;
pub mod types;

pub use broadcaster::{BroadcasterContext, SyncBroadcaster};
pub use types::{CanvasItem, EventPayload, ExportRecord, SyncEventType, SyncState, TabContentEvent};
