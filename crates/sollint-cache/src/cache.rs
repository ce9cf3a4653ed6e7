use crate::fingerprint::{hash_content, normalize_path};
use crate::storage::{CacheMetadata, CacheStorage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sollint_core::{CacheConfig, Clock, Result, SystemClock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One cached analysis result, keyed by normalized file path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry<R> {
    pub file_path: String,
    pub content_hash: String,
    pub config_hash: String,
    pub result: R,
    /// Unix milliseconds at insertion
    pub created_at: u64,
}

impl<R> CacheEntry<R> {
    pub fn is_expired(&self, now_millis: u64, ttl: Duration) -> bool {
        now_millis.saturating_sub(self.created_at) >= ttl.as_millis() as u64
    }

    fn matches(&self, content_hash: &str, config_hash: &str) -> bool {
        self.content_hash == content_hash && self.config_hash == config_hash
    }
}

/// Cache configuration options
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub cache_directory: PathBuf,
    pub ttl: Duration,
    pub max_entries: usize,
    pub use_file_system: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_directory: PathBuf::from(".sollint-cache"),
            ttl: Duration::from_secs(24 * 60 * 60),
            max_entries: 10_000,
            use_file_system: false,
        }
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            cache_directory: config.directory.clone(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries,
            use_file_system: config.use_file_system,
        }
    }
}

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub hit_rate: f64,
}

/// In-memory analysis result cache with optional on-disk persistence.
///
/// A lookup hits only when the normalized path, the content hash and the
/// configuration hash all match and the entry is younger than the TTL.
/// Capacity overflow evicts by oldest `created_at`; reads do not refresh age.
///
/// Single owner: mutation goes through `&mut self`, callers sharing a cache
/// across tasks wrap it in their own lock.
#[derive(Debug)]
pub struct ResultCache<R> {
    options: CacheOptions,
    entries: HashMap<String, CacheEntry<R>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
    clock: Arc<dyn Clock>,
}

impl<R> ResultCache<R>
where
    R: Clone + Serialize + DeserializeOwned,
{
    pub fn new(mut options: CacheOptions) -> Self {
        options.max_entries = options.max_entries.max(1);
        Self {
            options,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            expired: 0,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Insert or replace the result for `path`.
    pub fn set(&mut self, path: impl AsRef<Path>, content: &str, config_hash: &str, result: R) {
        let key = normalize_path(path);
        let entry = CacheEntry {
            file_path: key.clone(),
            content_hash: hash_content(content),
            config_hash: config_hash.to_string(),
            result,
            created_at: self.clock.now_millis(),
        };
        self.entries.insert(key.clone(), entry);
        self.evict_overflow(Some(&key));
    }

    /// Look up a fresh result. Counts one hit or one miss; an expired entry
    /// is dropped on the way.
    pub fn get(&mut self, path: impl AsRef<Path>, content: &str, config_hash: &str) -> Option<R> {
        let key = normalize_path(path);
        let now = self.clock.now_millis();
        let content_hash = hash_content(content);

        let outcome = match self.entries.get(&key) {
            None => Lookup::Absent,
            Some(entry) if entry.is_expired(now, self.options.ttl) => Lookup::Expired,
            Some(entry) if entry.matches(&content_hash, config_hash) => {
                Lookup::Hit(entry.result.clone())
            }
            Some(_) => Lookup::Stale,
        };

        match outcome {
            Lookup::Hit(result) => {
                self.hits += 1;
                Some(result)
            }
            Lookup::Expired => {
                self.entries.remove(&key);
                self.expired += 1;
                self.misses += 1;
                debug!(path = %key, "cache entry expired");
                None
            }
            Lookup::Absent | Lookup::Stale => {
                self.misses += 1;
                None
            }
        }
    }

    /// Same predicate as [`get`](Self::get) without touching statistics.
    pub fn has(&self, path: impl AsRef<Path>, content: &str, config_hash: &str) -> bool {
        let key = normalize_path(path);
        let now = self.clock.now_millis();
        let content_hash = hash_content(content);
        self.entries.get(&key).is_some_and(|entry| {
            !entry.is_expired(now, self.options.ttl) && entry.matches(&content_hash, config_hash)
        })
    }

    pub fn invalidate(&mut self, path: impl AsRef<Path>) {
        let key = normalize_path(path);
        if self.entries.remove(&key).is_some() {
            debug!(path = %key, "cache entry invalidated");
        }
    }

    /// Drop every entry. Hit and miss counters are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn cleanup(&mut self) -> usize {
        let now = self.clock.now_millis();
        let ttl = self.options.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now, ttl));
        let removed = before - self.entries.len();
        self.expired += removed as u64;
        if removed > 0 {
            debug!(removed, "expired cache entries cleaned up");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expired: self.expired,
            hit_rate: self.hit_rate(),
        }
    }

    /// Persist entries and metadata. No-op unless `use_file_system` is set.
    pub async fn save(&self) -> Result<()> {
        if !self.options.use_file_system {
            return Ok(());
        }

        let storage = CacheStorage::new(&self.options.cache_directory);
        let mut entries: Vec<&CacheEntry<R>> = self.entries.values().collect();
        entries.sort_by(|a, b| a.file_path.cmp(&b.file_path));

        let metadata = CacheMetadata::new(
            self.clock.now_millis(),
            self.options.ttl,
            entries.len(),
            self.hits,
            self.misses,
        );
        storage.write(&entries, &metadata).await?;

        info!(
            dir = %self.options.cache_directory.display(),
            entries = entries.len(),
            "cache saved"
        );
        Ok(())
    }

    /// Merge persisted entries into memory, skipping those already expired
    /// under this cache's TTL. Missing artifacts yield nothing. Returns the
    /// number of entries restored.
    pub async fn load(&mut self) -> Result<usize> {
        if !self.options.use_file_system {
            return Ok(0);
        }

        let storage = CacheStorage::new(&self.options.cache_directory);
        let Some(stored) = storage.read_entries::<R>().await? else {
            debug!(dir = %self.options.cache_directory.display(), "no persisted cache");
            return Ok(0);
        };

        let now = self.clock.now_millis();
        let total = stored.len();
        let mut restored = 0;
        for entry in stored {
            if entry.is_expired(now, self.options.ttl) {
                continue;
            }
            self.entries.insert(entry.file_path.clone(), entry);
            restored += 1;
        }

        if let Some(metadata) = storage.read_metadata().await {
            self.hits = metadata.hits;
            self.misses = metadata.misses;
        }

        self.evict_overflow(None);

        info!(
            dir = %self.options.cache_directory.display(),
            restored,
            skipped = total - restored,
            "cache loaded"
        );
        Ok(restored)
    }

    /// Remove the persisted artifacts, if any.
    pub async fn delete_cache(&self) -> Result<()> {
        CacheStorage::new(&self.options.cache_directory).remove().await
    }

    fn evict_overflow(&mut self, keep: Option<&str>) {
        if self.entries.len() <= self.options.max_entries {
            return;
        }

        let excess = self.entries.len() - self.options.max_entries;
        let mut candidates: Vec<(u64, String)> = self
            .entries
            .values()
            .filter(|entry| Some(entry.file_path.as_str()) != keep)
            .map(|entry| (entry.created_at, entry.file_path.clone()))
            .collect();
        candidates.sort();

        for (_, key) in candidates.into_iter().take(excess) {
            self.entries.remove(&key);
            self.evictions += 1;
        }
        debug!(evicted = excess, "cache capacity exceeded");
    }
}

enum Lookup<R> {
    Hit(R),
    Expired,
    Stale,
    Absent,
}
