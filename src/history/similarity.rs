//! Content similarity and duplicate grouping
//!
//! Similarity is the Jaccard index of the lowercase, whitespace-tokenized
//! word sets of two contents. It is symmetric and is 0 whenever either side
//! has no tokens.
//!
//! Duplicate detection compares a new item against every existing item, so
//! an insert costs O(n) comparisons over the whole history. That is fine for
//! a personal history but is the scalability ceiling of this store.

use super::types::EnhancedHistoryItem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default minimum similarity for two items to be grouped
pub const DUPLICATE_THRESHOLD: f64 = 0.8;

/// Tolerance so ratios like 4/5 compare equal to a 0.8 threshold
const THRESHOLD_EPSILON: f64 = 1e-9;

/// How a group's members relate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKind {
    /// Some member's content is byte-equal to the triggering item's
    Exact,
    Similar,
}

/// Which member to keep when consolidating a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationSuggestion {
    pub keep_item: String,
    pub reason: String,
    pub merge_content: bool,
}

/// A set of items whose content is near-identical
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub id: String,
    /// Triggering item first, then every match
    pub items: Vec<String>,
    /// Highest similarity observed against the triggering item
    pub similarity: f64,
    #[serde(rename = "type")]
    pub kind: DuplicateKind,
    pub consolidation_suggestion: ConsolidationSuggestion,
}

/// Lowercase whitespace-separated token set
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}

/// Jaccard similarity of the token sets of `a` and `b`
pub fn similarity(a: &str, b: &str) -> f64 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    intersection as f64 / union as f64
}

/// Whether a score reaches the threshold
pub fn meets_threshold(score: f64, threshold: f64) -> bool {
    score + THRESHOLD_EPSILON >= threshold
}

/// Compare `candidate` against `existing` and build a group when any item
/// reaches `threshold`. Items with no content and the candidate itself are
/// skipped.
pub fn check_for_duplicates(
    candidate: &EnhancedHistoryItem,
    existing: &[EnhancedHistoryItem],
    group_id: String,
    threshold: f64,
) -> Option<DuplicateGroup> {
    if candidate.item.content.trim().is_empty() {
        return None;
    }

    let mut matches: Vec<&EnhancedHistoryItem> = Vec::new();
    let mut max_similarity = 0.0_f64;
    let mut exact = false;

    for other in existing {
        if other.id() == candidate.id() {
            continue;
        }
        if other.item.content.trim().is_empty() {
            tracing::trace!(item_id = %other.id(), "Skipping duplicate check against empty content");
            continue;
        }

        let score = similarity(&candidate.item.content, &other.item.content);
        if meets_threshold(score, threshold) {
            max_similarity = max_similarity.max(score);
            exact |= other.item.content == candidate.item.content;
            matches.push(other);
        }
    }

    if matches.is_empty() {
        return None;
    }

    // Most recently added wins; the candidate wins ties
    let keep = matches.iter().copied().fold(candidate, |best, other| {
        if other.item.timestamp > best.item.timestamp {
            other
        } else {
            best
        }
    });

    let kind = if exact {
        DuplicateKind::Exact
    } else {
        DuplicateKind::Similar
    };

    let mut items = Vec::with_capacity(matches.len() + 1);
    items.push(candidate.id().to_string());
    items.extend(matches.iter().map(|m| m.id().to_string()));

    Some(DuplicateGroup {
        id: group_id,
        items,
        similarity: max_similarity,
        kind,
        consolidation_suggestion: ConsolidationSuggestion {
            keep_item: keep.id().to_string(),
            reason: "Most recently added item".to_string(),
            merge_content: kind == DuplicateKind::Similar,
        },
    })
}
