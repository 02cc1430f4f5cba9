//! History item types
//!
//! Defines the persisted item schema. All types use camelCase JSON
//! serialization so documents written by any replica read back identically.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Kind of generated content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    Video,
    Analytics,
    Strategy,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
            Self::Analytics => write!(f, "analytics"),
            Self::Strategy => write!(f, "strategy"),
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "analytics" => Ok(Self::Analytics),
            "strategy" => Ok(Self::Strategy),
            other => Err(format!("unknown content type: {}", other)),
        }
    }
}

/// Tri-state user rating, serialized as `1`, `-1` or `0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rating {
    Up,
    Down,
    #[default]
    Unrated,
}

impl Rating {
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
            Self::Unrated => 0,
        }
    }

    /// Any value other than `1` or `-1` is unrated
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Up,
            -1 => Self::Down,
            _ => Self::Unrated,
        }
    }
}

impl Serialize for Rating {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.as_i8())
    }
}

impl<'de> Deserialize<'de> for Rating {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(value.as_i64().map(Rating::from_i64).unwrap_or_default())
    }
}

/// `null` reads as an empty string
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Base unit of history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    pub platform: String,
    pub timestamp: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub rating: Rating,
    #[serde(default)]
    pub starred: bool,
}

/// Engagement numbers attached to an item (all default to 0)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyticsData {
    pub views: u64,
    pub engagement: f64,
    pub performance: f64,
}

/// One snapshot in an item's append-only version history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    pub timestamp: u64,
    pub change_note: String,
}

/// Change note of every item's first version
pub const INITIAL_VERSION_NOTE: &str = "Initial creation";

/// The store's working representation of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedHistoryItem {
    #[serde(flatten)]
    pub item: HistoryItem,
    #[serde(default)]
    pub smart_folders: Vec<String>,
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_group_id: Option<String>,
    #[serde(default)]
    pub ai_tags: Vec<String>,
    #[serde(default)]
    pub analytics_data: AnalyticsData,
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
    /// Last local mutation; decides which copy wins when replicas merge
    #[serde(default)]
    pub updated_at: u64,
}

impl EnhancedHistoryItem {
    pub fn id(&self) -> &str {
        &self.item.id
    }

    /// Merge ordering key: later `updatedAt` wins, then later creation
    pub(crate) fn revision(&self) -> (u64, u64) {
        (self.updated_at.max(self.item.timestamp), self.item.timestamp)
    }
}

/// Input for adding an item; every field may be missing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewHistoryItem {
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub content_type: Option<ContentType>,
    pub content: Option<String>,
    pub platform: Option<String>,
    pub timestamp: Option<u64>,
    pub tags: Vec<String>,
    pub rating: Option<Rating>,
    pub starred: bool,
    pub analytics_data: Option<AnalyticsData>,
    /// Free-form metadata from the generator, kept out of the item itself
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NewHistoryItem {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn text(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: Some(content.into()),
            content_type: Some(ContentType::Text),
            ..Default::default()
        }
    }
}

/// Shallow partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryItemUpdate {
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub content_type: Option<ContentType>,
    pub content: Option<String>,
    pub platform: Option<String>,
    pub tags: Option<Vec<String>>,
    pub rating: Option<Rating>,
    pub starred: Option<bool>,
    pub analytics_data: Option<AnalyticsData>,
    /// Note recorded in the version history when `content` changes
    pub change_note: Option<String>,
}

impl HistoryItemUpdate {
    pub fn rating(rating: Rating) -> Self {
        Self {
            rating: Some(rating),
            ..Default::default()
        }
    }

    pub fn content(content: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            change_note: Some(note.into()),
            ..Default::default()
        }
    }
}
