//! Merge functions for lists shared between replicas
//!
//! Writers never blindly overwrite a shared list: they read what is stored,
//! merge it with their own view and write the union back. Merges are
//! commutative in membership, so replicas converge once writes stop.

use super::types::EnhancedHistoryItem;
use std::collections::{BTreeMap, HashMap};

/// Deleted item ids mapped to their deletion time
pub type Tombstones = BTreeMap<String, u64>;

/// Types addressable by a string id
pub trait Identified {
    fn id(&self) -> &str;
}

impl Identified for EnhancedHistoryItem {
    fn id(&self) -> &str {
        &self.item.id
    }
}

impl Identified for super::classify::SmartFolder {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for super::similarity::DuplicateGroup {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for super::collections::CustomCollection {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Union of two lists by id.
///
/// Order is `primary` first, then entries only `secondary` has. On an id
/// conflict `replace(primary_entry, secondary_entry)` decides whether the
/// secondary copy wins.
pub fn union_by_id<T, F>(primary: &[T], secondary: &[T], replace: F) -> Vec<T>
where
    T: Identified + Clone,
    F: Fn(&T, &T) -> bool,
{
    let mut merged: Vec<T> = primary.to_vec();
    let index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id().to_string(), i))
        .collect();

    for entry in secondary {
        match index.get(entry.id()) {
            Some(&i) => {
                if replace(&merged[i], entry) {
                    merged[i] = entry.clone();
                }
            }
            None => merged.push(entry.clone()),
        }
    }
    merged
}

/// Keep the newest deletion time per id
pub fn merge_tombstones(into: &mut Tombstones, other: &Tombstones) -> bool {
    let mut changed = false;
    for (id, deleted_at) in other {
        let entry = into.entry(id.clone()).or_insert(0);
        if *deleted_at > *entry {
            *entry = *deleted_at;
            changed = true;
        }
    }
    changed
}

/// Whether a tombstone hides this copy of an item
pub fn is_tombstoned(item: &EnhancedHistoryItem, tombstones: &Tombstones) -> bool {
    tombstones
        .get(item.id())
        .is_some_and(|deleted_at| *deleted_at >= item.revision().0)
}

/// Canonical history order: newest first, id as tie-break
pub fn sort_history(items: &mut [EnhancedHistoryItem]) {
    items.sort_by(|a, b| {
        b.item
            .timestamp
            .cmp(&a.item.timestamp)
            .then_with(|| a.id().cmp(b.id()))
    });
}

/// Merge two history lists.
///
/// Union by id; the copy with the later revision wins and `primary` wins
/// ties. Tombstoned copies are dropped and the result is in canonical order.
pub fn merge_history(
    primary: &[EnhancedHistoryItem],
    secondary: &[EnhancedHistoryItem],
    tombstones: &Tombstones,
) -> Vec<EnhancedHistoryItem> {
    let mut merged = union_by_id(primary, secondary, |p, s| s.revision() > p.revision());
    merged.retain(|item| !is_tombstoned(item, tombstones));
    sort_history(&mut merged);
    merged
}
