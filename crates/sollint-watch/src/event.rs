use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Change,
    Remove,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Add => write!(f, "add"),
            ChangeType::Change => write!(f, "change"),
            ChangeType::Remove => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub file_path: PathBuf,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
}

impl FileChangeEvent {
    pub fn new(file_path: PathBuf, change_type: ChangeType) -> Self {
        Self {
            file_path,
            change_type,
            timestamp: Utc::now(),
        }
    }
}

/// Everything a running watcher reports on its event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Initial scan finished and the backend is subscribed.
    Ready { files_watched: usize },
    Change(FileChangeEvent),
    /// A backend fault. The watcher keeps running.
    Error { message: String, paths: Vec<PathBuf> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherStats {
    pub files_watched: usize,
    pub changes_detected: u64,
    pub last_change_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Idle,
    Watching,
}

/// What the watcher remembers about a file to tell a real edit from a
/// spurious notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSignature {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl From<&Metadata> for FileSignature {
    fn from(metadata: &Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub path: PathBuf,
    /// `None` while the file does not exist
    pub signature: Option<FileSignature>,
}
