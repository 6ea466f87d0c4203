use crate::error::CacheError;
use crate::fingerprint::{Fingerprint, SourceStat};
use crate::util::now_secs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// The renderer is running (or crashed); the directory lives under `temp/`.
    Working,
    /// Installed; the directory lives under `finished/`.
    Finished,
}

/// One attempt at caching one fingerprint.
///
/// Fields this version does not know about are kept in `extra` and written
/// back untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Directory basename under `temp/` or `finished/`, depending on `status`.
    pub path: String,
    pub id: String,
    pub status: EntryStatus,
    pub mtime: f64,
    pub atime: f64,
    pub key: Fingerprint,
    pub file_mtime: f64,
    pub file_size: u64,
    #[serde(default)]
    pub cache_size: u64,
    pub book_path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CacheEntry {
    pub fn new_working(key: Fingerprint, book_path: String, stat: &SourceStat, dir: String) -> Self {
        let now = now_secs();
        Self {
            path: dir,
            id: uuid::Uuid::new_v4().to_string(),
            status: EntryStatus::Working,
            mtime: now,
            atime: now,
            key,
            file_mtime: stat.mtime,
            file_size: stat.size,
            cache_size: 0,
            book_path,
            extra: Map::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == EntryStatus::Finished
    }
}

/// The cache-wide document stored in `metadata.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub entries: BTreeMap<Fingerprint, Vec<CacheEntry>>,
    /// When the global sweep last ran, in seconds since the epoch.
    #[serde(default)]
    pub last_clear_at: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CacheMetadata {
    /// Decode a metadata document, treating an empty or corrupt one as empty.
    pub fn parse(bytes: &[u8], source: &Path) -> Self {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Self::default();
        }
        match serde_json::from_slice(bytes) {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(
                    target = "viewer.cache",
                    path = %source.display(),
                    error = %err,
                    "cache metadata is corrupt; starting from an empty document"
                );
                Self::default()
            }
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn iter_entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values().flatten()
    }

    /// Remove the entry with `id` from the list under `key`, dropping the list if it empties.
    pub(crate) fn remove_entry(&mut self, key: &Fingerprint, id: &str) -> Option<CacheEntry> {
        let list = self.entries.get_mut(key)?;
        let pos = list.iter().position(|entry| entry.id == id)?;
        let removed = list.remove(pos);
        if list.is_empty() {
            self.entries.remove(key);
        }
        Some(removed)
    }

    /// Replace the entry with the same `id` under `entry.key`, or append it.
    pub(crate) fn upsert_entry(&mut self, entry: CacheEntry) {
        let list = self.entries.entry(entry.key.clone()).or_default();
        match list.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => list.push(entry),
        }
    }

    pub(crate) fn drop_empty_lists(&mut self) {
        self.entries.retain(|_, list| !list.is_empty());
    }
}
