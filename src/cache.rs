//! Persistent provider caches.
//!
//! Both provider resolvers keep a small JSON cache of lookup outcomes so
//! that repeated preparations of the same dump do not hit the network. An
//! entry is either positive (a resolved record) or negative (a recorded
//! miss); both count as hits until they expire. A sidecar index remembers
//! which `(commit, platform)` pairs already have a merged symbol layout on
//! disk.
//!
//! Cache files are process-shared only through atomic-rewrite semantics:
//! concurrent writers may lose entries but can never corrupt the document,
//! and a corrupt or missing document simply loads as an empty cache.

use crate::utils;
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

/// File name of the pipeline-provider build cache.
pub const BUILD_CACHE_FILENAME: &str = "azure_pipelines_cache.json";
/// File name of the release-provider cache.
pub const RELEASE_CACHE_FILENAME: &str = "github_releases_cache.json";
/// File name of the downloaded-symbols index.
pub const DOWNLOAD_INDEX_FILENAME: &str = "downloaded_symbols_index.json";

/// How long build/release lookups stay fresh.
pub fn lookup_ttl() -> Duration {
    Duration::hours(1)
}

/// A single cached lookup outcome. `value: None` is a negative entry, i.e.
/// a remembered definitive miss.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct CacheEntry<T> {
    pub cached_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
}

impl<T> CacheEntry<T> {
    fn new(value: Option<T>) -> Self {
        Self { cached_at: Utc::now(), value }
    }

    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.cached_at + ttl >= now
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument<T> {
    #[serde(default = "HashMap::new")]
    entries: HashMap<String, CacheEntry<T>>,
}

/// A TTL'd key/value store persisted as a single JSON document.
///
/// Keys are lowercased. Expired entries are dropped on access. Loading
/// never fails (a corrupt file yields an empty cache) and saving is
/// best-effort; dropping the cache also saves it when dirty.
#[derive(Debug)]
pub struct PersistentCache<T: Serialize> {
    path: PathBuf,
    ttl: Duration,
    entries: HashMap<String, CacheEntry<T>>,
    dirty: bool,
}

impl<T: Serialize + DeserializeOwned> PersistentCache<T> {
    /// Loads the cache stored at `dir/file_name`, returning an empty cache
    /// for a missing or unreadable document.
    pub fn load(dir: &Path, file_name: &str, ttl: Duration) -> Self {
        let path = dir.join(file_name);
        let entries = match utils::read_json_file::<CacheDocument<T>>(&path) {
            Ok(doc) => {
                trace!("read cache \"{}\" with {} entries", path.display(), doc.entries.len());
                doc.entries
            }
            Err(err) => {
                if path.exists() {
                    warn!("discarding unreadable cache \"{}\": {err}", path.display());
                }
                HashMap::new()
            }
        };
        Self { path, ttl, entries, dirty: false }
    }
}

impl<T: Serialize> PersistentCache<T> {
    /// Looks up `key`.
    ///
    /// Returns `None` when there is no usable entry, `Some(None)` for a
    /// fresh negative entry and `Some(Some(value))` for a fresh positive
    /// one. Expired entries are removed.
    pub fn try_get(&mut self, key: &str) -> Option<Option<&T>> {
        let key = key.to_lowercase();
        let now = Utc::now();
        if let Some(entry) = self.entries.get(&key) {
            if entry.is_fresh(self.ttl, now) {
                // borrow again to decouple lifetimes from the check above
                return Some(self.entries.get(&key).and_then(|e| e.value.as_ref()));
            }
            trace!("evicting expired cache entry for \"{key}\"");
            self.entries.remove(&key);
            self.dirty = true;
        }
        None
    }

    /// Records a positive (`Some`) or negative (`None`) outcome for `key`.
    pub fn insert(&mut self, key: &str, value: Option<T>) {
        self.entries.insert(key.to_lowercase(), CacheEntry::new(value));
        self.dirty = true;
    }

    /// Removes the entry for `key`, if any.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let removed = self.entries.remove(&key.to_lowercase());
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the cache document. Failures are logged and swallowed; a
    /// broken cache must never take the run down.
    pub fn save(&mut self) {
        if !self.dirty {
            return;
        }
        let doc = CacheDocument { entries: std::mem::take(&mut self.entries) };
        let result = utils::write_json_file(&doc, &self.path);
        self.entries = doc.entries;
        match result {
            Ok(()) => self.dirty = false,
            Err(err) => warn!("failed to save cache \"{}\": {err}", self.path.display()),
        }
    }
}

impl<T: Serialize> Drop for PersistentCache<T> {
    fn drop(&mut self) {
        self.save();
    }
}

/// Maps `(commit, platform suffix)` to the directory holding the merged
/// symbol layout for that pair.
///
/// Entries are verified on read; an entry whose directory no longer exists
/// is evicted lazily.
#[derive(Debug)]
pub struct DownloadedSymbolsIndex {
    path: PathBuf,
    entries: HashMap<String, PathBuf>,
    dirty: bool,
}

impl DownloadedSymbolsIndex {
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(DOWNLOAD_INDEX_FILENAME);
        let entries = match utils::read_json_file::<HashMap<String, PathBuf>>(&path) {
            Ok(entries) => entries,
            Err(err) => {
                if path.exists() {
                    warn!("discarding unreadable index \"{}\": {err}", path.display());
                }
                HashMap::new()
            }
        };
        Self { path, entries, dirty: false }
    }

    fn key(commit: &str, suffix: &str) -> String {
        format!("{}|{}", commit.to_lowercase(), suffix.to_lowercase())
    }

    /// Returns the layout directory recorded for `(commit, suffix)` when it
    /// still exists on disk.
    pub fn get(&mut self, commit: &str, suffix: &str) -> Option<PathBuf> {
        let key = Self::key(commit, suffix);
        match self.entries.get(&key) {
            Some(dir) if dir.is_dir() => Some(dir.clone()),
            Some(dir) => {
                trace!("evicting stale symbols index entry \"{key}\" -> \"{}\"", dir.display());
                self.entries.remove(&key);
                self.dirty = true;
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, commit: &str, suffix: &str, dir: PathBuf) {
        self.entries.insert(Self::key(commit, suffix), dir);
        self.dirty = true;
    }

    /// Best-effort save, mirroring [`PersistentCache::save`].
    pub fn save(&mut self) {
        if !self.dirty {
            return;
        }
        match utils::write_json_file(&self.entries, &self.path) {
            Ok(()) => self.dirty = false,
            Err(err) => warn!("failed to save index \"{}\": {err}", self.path.display()),
        }
    }
}

impl Drop for DownloadedSymbolsIndex {
    fn drop(&mut self) {
        self.save();
    }
}
