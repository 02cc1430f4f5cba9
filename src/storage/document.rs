//! JSON documents on the shared medium
//!
//! Lists are decoded entry by entry, so one malformed entry written by
//! another replica is dropped instead of failing the whole document. A read
//! that fails outright is an error: callers must not merge against a list
//! they could not see.

use super::SharedStorage;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Decode already-split entries, dropping those that do not parse
pub fn decode_entries<T: DeserializeOwned>(entries: Vec<serde_json::Value>) -> Vec<T> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Dropping malformed stored entry: {}", e);
                None
            }
        })
        .collect()
}

/// Decode a JSON array leniently. Fails only when `raw` is not an array.
pub fn decode_list<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(raw)?;
    Ok(decode_entries(entries))
}

/// Read a list; `Ok(None)` when the key is missing
pub async fn read_list<T: DeserializeOwned>(
    storage: &dyn SharedStorage,
    key: &str,
) -> Result<Option<Vec<T>>> {
    match storage.get(key).await? {
        Some(raw) => decode_list(&raw).map(Some),
        None => Ok(None),
    }
}

/// Read a whole document; `Ok(None)` when the key is missing
pub async fn read_document<T: DeserializeOwned>(
    storage: &dyn SharedStorage,
    key: &str,
) -> Result<Option<T>> {
    match storage.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and write `value`. Returns whether the write landed.
pub async fn write_document<T: Serialize + ?Sized>(
    storage: &dyn SharedStorage,
    key: &str,
    value: &T,
) -> bool {
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(key, "Failed to serialize document: {}", e);
            return false;
        }
    };
    match storage.set(key, &json).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(key, "Failed to persist document: {}", e);
            false
        }
    }
}
