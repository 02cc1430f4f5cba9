//! File-backed shared storage
//!
//! Directory layout:
//! ```text
//! <storage dir>/
//! ├── content_history.history.json
//! ├── content_history.sync.json
//! └── ...
//! ```
//!
//! Several processes pointing at the same directory act as replicas. A
//! polling watcher fingerprints every document and signals the ones whose
//! content changed since this handle last wrote or observed them.

use super::{SharedStorage, StorageChange, StorageChanges, CHANGE_CHANNEL_CAPACITY};
use crate::error::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// Origin reported for changes detected on disk
const EXTERNAL_ORIGIN: &str = "external";

/// Directory of JSON documents acting as the shared medium
#[derive(Clone)]
pub struct FileStorage {
    dir: PathBuf,
    origin: String,
    poll_interval: Duration,
    /// Key -> sha256 of the content last written or observed by this handle
    fingerprints: Arc<RwLock<HashMap<String, String>>>,
    changes: broadcast::Sender<StorageChange>,
    watcher_started: Arc<AtomicBool>,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory
    pub async fn open(dir: PathBuf, poll_interval: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let storage = Self {
            fingerprints: Arc::new(RwLock::new(scan_fingerprints(&dir))),
            dir,
            origin: format!("file-{}", uuid::Uuid::new_v4()),
            poll_interval,
            changes,
            watcher_started: Arc::new(AtomicBool::new(false)),
        };
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem_for(key)))
    }

    /// Compare every document on disk with the recorded fingerprints and
    /// signal the ones that differ. Returns the number of changes emitted.
    pub async fn poll_once(&self) -> usize {
        poll_dir(&self.dir, &self.fingerprints, &self.changes).await
    }

    fn spawn_watcher(&self) {
        if self.watcher_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let dir = self.dir.clone();
        let fingerprints = Arc::clone(&self.fingerprints);
        let changes = self.changes.clone();
        let interval = self.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if changes.receiver_count() == 0 {
                    tracing::debug!(dir = %dir.display(), "File watcher stopped: no subscribers");
                    break;
                }
                poll_dir(&dir, &fingerprints, &changes).await;
            }
        });
    }
}

#[async_trait]
impl SharedStorage for FileStorage {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));

        // Write-then-rename so pollers never observe a half-written document
        tokio::fs::write(&tmp, value).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        self.fingerprints
            .write()
            .await
            .insert(file_stem_for(key), fingerprint(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.fingerprints.write().await.remove(&file_stem_for(key));
        Ok(())
    }

    /// Subscribe to changes made by other processes.
    ///
    /// The first call starts the polling watcher and must happen inside a
    /// tokio runtime.
    fn watch(&self) -> StorageChanges {
        let rx = self.changes.subscribe();
        self.spawn_watcher();
        StorageChanges::new(rx, self.origin.clone())
    }
}

/// Map a storage key onto a safe file stem
fn file_stem_for(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn fingerprint(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// List `(stem, path)` for every JSON document in the directory
fn json_documents(dir: &Path) -> Vec<(String, PathBuf)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read directory {}: {}", dir.display(), e);
            }
            return Vec::new();
        }
    };

    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
        .filter_map(|path| {
            let stem = path.file_stem()?.to_str()?.to_string();
            Some((stem, path))
        })
        .collect()
}

fn scan_fingerprints(dir: &Path) -> HashMap<String, String> {
    json_documents(dir)
        .into_iter()
        .filter_map(|(stem, path)| {
            let data = std::fs::read_to_string(&path).ok()?;
            Some((stem, fingerprint(&data)))
        })
        .collect()
}

async fn poll_dir(
    dir: &Path,
    fingerprints: &RwLock<HashMap<String, String>>,
    changes: &broadcast::Sender<StorageChange>,
) -> usize {
    let mut pending = Vec::new();
    let mut seen = Vec::new();

    for (stem, path) in json_documents(dir) {
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                continue;
            }
        };
        seen.push(stem.clone());
        pending.push((stem, data));
    }

    let mut emitted = Vec::new();
    {
        let mut known = fingerprints.write().await;
        for (stem, data) in pending {
            let print = fingerprint(&data);
            if known.get(&stem) != Some(&print) {
                known.insert(stem.clone(), print);
                emitted.push((stem, Some(data)));
            }
        }

        let vanished: Vec<String> = known
            .keys()
            .filter(|stem| !seen.contains(stem))
            .cloned()
            .collect();
        for stem in vanished {
            known.remove(&stem);
            emitted.push((stem, None));
        }
    }

    let count = emitted.len();
    for (key, new_value) in emitted {
        let _ = changes.send(StorageChange {
            key,
            new_value,
            origin: EXTERNAL_ORIGIN.to_string(),
        });
    }
    count
}
