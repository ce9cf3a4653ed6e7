use crate::CacheEntry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sollint_core::{Result, SollintError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

/// File holding the entry table
pub const ENTRIES_FILE: &str = "entries.json";
/// File holding cache-level metadata and statistics
pub const METADATA_FILE: &str = "metadata.json";

pub const FORMAT_VERSION: u32 = 1;

/// Cache-level metadata persisted next to the entry table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: u32,
    /// Unix milliseconds of the save
    pub saved_at: u64,
    pub ttl_ms: u64,
    pub entry_count: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheMetadata {
    pub fn new(saved_at: u64, ttl: Duration, entry_count: usize, hits: u64, misses: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            saved_at,
            ttl_ms: ttl.as_millis() as u64,
            entry_count,
            hits,
            misses,
        }
    }
}

/// On-disk layout of a persisted cache: one directory, two JSON artifacts.
#[derive(Debug, Clone)]
pub struct CacheStorage {
    dir: PathBuf,
}

impl CacheStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn entries_path(&self) -> PathBuf {
        self.dir.join(ENTRIES_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Write both artifacts, creating the directory tree first.
    pub async fn write<R: Serialize>(
        &self,
        entries: &[&CacheEntry<R>],
        metadata: &CacheMetadata,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let entries_json = serde_json::to_vec(entries)?;
        write_atomic(&self.entries_path(), &entries_json).await?;

        let metadata_json = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&self.metadata_path(), &metadata_json).await?;

        debug!(dir = %self.dir.display(), "cache artifacts written");
        Ok(())
    }

    /// Read the entry table. `None` when the directory or file is absent.
    pub async fn read_entries<R: DeserializeOwned>(&self) -> Result<Option<Vec<CacheEntry<R>>>> {
        let bytes = match fs::read(self.entries_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SollintError::Io(e)),
        };

        let entries = serde_json::from_slice(&bytes).map_err(|e| {
            SollintError::Cache(format!(
                "corrupt cache file {}: {}",
                self.entries_path().display(),
                e
            ))
        })?;
        Ok(Some(entries))
    }

    /// Read the metadata artifact. Absent or unreadable metadata is not fatal.
    pub async fn read_metadata(&self) -> Option<CacheMetadata> {
        let bytes = match fs::read(self.metadata_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.metadata_path().display(), error = %e, "failed to read cache metadata");
                return None;
            }
        };

        match serde_json::from_slice::<CacheMetadata>(&bytes) {
            Ok(metadata) if metadata.version == FORMAT_VERSION => Some(metadata),
            Ok(metadata) => {
                warn!(version = metadata.version, "ignoring cache metadata with unknown version");
                None
            }
            Err(e) => {
                warn!(path = %self.metadata_path().display(), error = %e, "corrupt cache metadata");
                None
            }
        }
    }

    /// Remove both artifacts together. Missing files are fine.
    pub async fn remove(&self) -> Result<()> {
        for path in [self.entries_path(), self.metadata_path()] {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "removed cache artifact"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(SollintError::Io(e)),
            }
        }

        // Leave the directory alone if anything else lives in it.
        if let Err(e) = fs::remove_dir(&self.dir).await {
            debug!(dir = %self.dir.display(), error = %e, "cache directory kept");
        }
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
