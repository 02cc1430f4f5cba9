//! Content history
//!
//! Versioned history items, rule-based smart folders, similarity-based
//! duplicate grouping and manual collections.

pub mod classify;
pub mod collections;
pub mod merge;
pub mod similarity;
pub mod store;
pub mod tagging;
pub mod types;

pub use classify::{DateRange, FolderRules, NewSmartFolder, SmartFolder};
pub use collections::{CollectionManager, CustomCollection, NewCollection};
pub use similarity::{DuplicateGroup, DuplicateKind};
pub use store::{HistoryStore, StoreContext};
pub use tagging::{KeywordTagger, Tagger};
pub use types::{
    AnalyticsData, ContentType, EnhancedHistoryItem, HistoryItem, HistoryItemUpdate,
    NewHistoryItem, Rating, VersionEntry,
};
