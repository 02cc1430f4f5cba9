//! Rule-based smart folder classification
//!
//! A folder's rules are a conjunction: every clause that is present must
//! hold, absent (or empty) clauses are vacuously true. Membership depends on
//! nothing but the item and the rules, so recomputing it is idempotent.

use super::types::{ContentType, EnhancedHistoryItem};
use serde::{Deserialize, Serialize};

const DAY_MILLIS: u64 = 24 * 60 * 60 * 1_000;

/// Inclusive timestamp window; a missing bound is open on that side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

impl DateRange {
    pub fn contains(&self, timestamp: u64) -> bool {
        self.start.map_or(true, |start| timestamp >= start)
            && self.end.map_or(true, |end| timestamp <= end)
    }
}

/// Conjunctive folder predicate
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderRules {
    /// Any keyword appearing (case-insensitively) in title or content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_types: Option<Vec<ContentType>>,
    /// Any of these tags present on the item
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_min: Option<f64>,
}

/// A named, rule-defined virtual grouping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartFolder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rules: FolderRules,
    /// When false, membership is never computed automatically
    #[serde(default)]
    pub auto_organize: bool,
    /// Advisory cache of current membership
    #[serde(default)]
    pub item_count: usize,
}

/// Request for creating a smart folder
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewSmartFolder {
    pub name: String,
    pub rules: FolderRules,
    pub auto_organize: bool,
}

/// Non-empty list clause, or `None` when the clause is vacuous
fn clause<T>(list: &Option<Vec<T>>) -> Option<&[T]> {
    list.as_deref().filter(|l| !l.is_empty())
}

/// Evaluate a folder's rules against an item
pub fn matches_rules(item: &EnhancedHistoryItem, rules: &FolderRules) -> bool {
    if let Some(keywords) = clause(&rules.keywords) {
        let haystack = format!("{} {}", item.item.title, item.item.content).to_lowercase();
        if !keywords
            .iter()
            .any(|k| haystack.contains(&k.to_lowercase()))
        {
            return false;
        }
    }

    if let Some(platforms) = clause(&rules.platforms) {
        if !platforms.iter().any(|p| p == &item.item.platform) {
            return false;
        }
    }

    if let Some(types) = clause(&rules.content_types) {
        if !types.contains(&item.item.content_type) {
            return false;
        }
    }

    if let Some(tags) = clause(&rules.tags) {
        if !tags.iter().any(|t| item.item.tags.contains(t)) {
            return false;
        }
    }

    if let Some(range) = &rules.date_range {
        if !range.contains(item.item.timestamp) {
            return false;
        }
    }

    if let Some(min) = rules.performance_min {
        if item.analytics_data.performance < min {
            return false;
        }
    }

    true
}

/// Ids of every auto-organizing folder the item belongs to
pub fn classify(item: &EnhancedHistoryItem, folders: &[SmartFolder]) -> Vec<String> {
    folders
        .iter()
        .filter(|f| f.auto_organize && matches_rules(item, &f.rules))
        .map(|f| f.id.clone())
        .collect()
}

/// Folders bootstrapped when storage holds none
pub fn default_smart_folders(now: u64) -> Vec<SmartFolder> {
    vec![
        SmartFolder {
            id: "high-performance".to_string(),
            name: "High Performance".to_string(),
            rules: FolderRules {
                performance_min: Some(80.0),
                ..Default::default()
            },
            auto_organize: true,
            item_count: 0,
        },
        SmartFolder {
            id: "video-content".to_string(),
            name: "Video Content".to_string(),
            rules: FolderRules {
                content_types: Some(vec![ContentType::Video]),
                ..Default::default()
            },
            auto_organize: true,
            item_count: 0,
        },
        SmartFolder {
            id: "recent-viral".to_string(),
            name: "Recent Viral".to_string(),
            rules: FolderRules {
                keywords: Some(vec!["viral".to_string(), "trending".to_string()]),
                date_range: Some(DateRange {
                    start: Some(now.saturating_sub(7 * DAY_MILLIS)),
                    end: None,
                }),
                ..Default::default()
            },
            auto_organize: true,
            item_count: 0,
        },
    ]
}
