use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Watcher is already running")]
    AlreadyRunning,

    #[error("Watcher is not running")]
    NotRunning,

    #[error("Invalid ignore pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
