//! Content History - local-first content history kept consistent across replicas
//!
//! Several replicas of one client share nothing but a text key-value storage
//! medium that signals every write to the other replicas. Each replica keeps
//! an in-memory view of a versioned, classified and deduplicated content
//! history and converges with the others through read-merge-write
//! persistence and an idempotent event queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── HistoryService (one replica) ───────────────────┐
//! │  ┌──────────────┐   ┌────────────────────┐   ┌──────────────────────────┐   │
//! │  │ HistoryStore │   │ CollectionManager  │   │     SyncBroadcaster      │   │
//! │  │ - classify   │   │ - manual groups    │   │ - pendingSync queue      │   │
//! │  │ - dedupe     │   │ - lazy resolution  │   │ - dedup by event id      │   │
//! │  │ - versions   │   └─────────┬──────────┘   │ - 1 h pruning window     │   │
//! │  └──────┬───────┘             │              └────────────┬─────────────┘   │
//! │         └─────────────────────┼───────────────────────────┘                 │
//! │                     SubscriptionRegistry (history / event type / "*")       │
//! └───────────────────────────────┼─────────────────────────────────────────────┘
//!                                 │ get / set / change signal
//!                   ┌─────────────▼──────────────┐
//!                   │ SharedStorage              │
//!                   │ (MemoryStorage, FileStorage)│
//!                   └────────────────────────────┘
//! ```
//!
//! ## Key Features
//!
//! - **Smart folders**: rule-based, recomputed membership
//! - **Duplicate groups**: token-set Jaccard similarity at a 0.8 threshold
//! - **Collections**: manual, many-to-many grouping
//! - **Cross-replica events**: at-least-once delivery, idempotent replay

pub mod clock;
pub mod config;
pub mod error;
pub mod history;
pub mod service;
pub mod storage;
pub mod subscription;
pub mod sync;

pub use error::{Error, Result};
pub use service::{HistoryService, ServiceHandle};
