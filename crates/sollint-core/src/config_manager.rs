use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for sollint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SollintConfig {
    /// Analysis result cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Worker pool used for per-file analysis
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Watch mode settings
    #[serde(default)]
    pub watch: WatchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Keep analysis results on disk between runs
    #[serde(default = "default_use_file_system")]
    pub use_file_system: bool,

    /// Directory holding the persisted cache artifacts
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,

    /// Entry lifetime in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum number of cached files before oldest entries are evicted
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            use_file_system: default_use_file_system(),
            directory: default_cache_directory(),
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Upper bound on simultaneously running analysis tasks
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Stop dispatching new tasks after the first failure
    #[serde(default)]
    pub stop_on_error: bool,

    /// Per-task timeout in milliseconds (0 = no timeout)
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            stop_on_error: false,
            task_timeout_ms: default_task_timeout_ms(),
        }
    }
}

/// Watch mode configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Quiet period before a burst of events on one file is reported (ms)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Interval for the polling backend (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Force the polling backend instead of native notifications
    #[serde(default)]
    pub use_polling: bool,

    /// Window in which changes across files are collected into one batch (ms)
    #[serde(default = "default_aggregation_window_ms")]
    pub aggregation_window_ms: u64,

    /// Deliver changes as batches instead of one callback per file
    #[serde(default = "default_aggregate_changes")]
    pub aggregate_changes: bool,

    /// File extensions to watch (without the dot)
    #[serde(default = "default_watch_extensions")]
    pub extensions: Vec<String>,

    /// Glob patterns for paths to ignore; matched against path segments too
    #[serde(default = "default_watch_ignored")]
    pub ignored: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            use_polling: false,
            aggregation_window_ms: default_aggregation_window_ms(),
            aggregate_changes: default_aggregate_changes(),
            extensions: default_watch_extensions(),
            ignored: default_watch_ignored(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_use_file_system() -> bool {
    true
}
fn default_cache_directory() -> PathBuf {
    PathBuf::from(".sollint-cache")
}
fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_cache_max_entries() -> usize {
    10_000
}
fn default_max_concurrency() -> usize {
    num_cpus::get().max(1)
}
fn default_task_timeout_ms() -> u64 {
    30_000
}
fn default_debounce_ms() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_aggregation_window_ms() -> u64 {
    500
}
fn default_aggregate_changes() -> bool {
    true
}
fn default_watch_extensions() -> Vec<String> {
    vec!["sol".to_string()]
}
fn default_watch_ignored() -> Vec<String> {
    vec![
        "node_modules".to_string(),
        ".git".to_string(),
        ".sollint-cache".to_string(),
    ]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Loads, overrides and validates [`SollintConfig`]
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: SollintConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (`SOLLINT_*`, `RUST_LOG`)
    /// 2. Config file (explicit path, `.sollint.toml`, `~/.sollint/config.toml`)
    /// 3. Defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, config_path) = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.display().to_string()));
                }
                (Self::read_toml_file(path)?, Some(path.to_path_buf()))
            }
            None => Self::load_config_file()?,
        };

        let config = Self::apply_env_overrides(config, |key| std::env::var(key).ok());
        Self::validate_config(&config)?;

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Wrap an already-built configuration after validating it.
    pub fn from_config(config: SollintConfig) -> Result<Self, ConfigError> {
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: None,
        })
    }

    /// Search order:
    /// 1. ./.sollint.toml
    /// 2. ~/.sollint/config.toml
    /// 3. defaults
    fn load_config_file() -> Result<(SollintConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".sollint.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".sollint").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((SollintConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<SollintConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env_overrides<F>(mut config: SollintConfig, var: F) -> SollintConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |v: String| v.eq_ignore_ascii_case("true") || v == "1";

        // Cache
        if let Some(dir) = var("SOLLINT_CACHE_DIR") {
            config.cache.directory = PathBuf::from(dir);
        }
        if let Some(ttl) = var("SOLLINT_CACHE_TTL_SECS").and_then(|v| v.parse().ok()) {
            config.cache.ttl_secs = ttl;
        }
        if let Some(max) = var("SOLLINT_CACHE_MAX_ENTRIES").and_then(|v| v.parse().ok()) {
            config.cache.max_entries = max;
        }
        if let Some(persist) = var("SOLLINT_CACHE_PERSIST") {
            config.cache.use_file_system = flag(persist);
        }

        // Scheduler
        if let Some(n) = var("SOLLINT_MAX_CONCURRENCY").and_then(|v| v.parse().ok()) {
            config.scheduler.max_concurrency = n;
        }
        if let Some(stop) = var("SOLLINT_STOP_ON_ERROR") {
            config.scheduler.stop_on_error = flag(stop);
        }
        if let Some(ms) = var("SOLLINT_TASK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.scheduler.task_timeout_ms = ms;
        }

        // Watch
        if let Some(ms) = var("SOLLINT_WATCH_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            config.watch.debounce_ms = ms;
        }
        if let Some(ms) = var("SOLLINT_WATCH_AGGREGATION_MS").and_then(|v| v.parse().ok()) {
            config.watch.aggregation_window_ms = ms;
        }
        if let Some(polling) = var("SOLLINT_WATCH_POLLING") {
            config.watch.use_polling = flag(polling);
        }

        // Logging
        if let Some(level) = var("RUST_LOG") {
            config.logging.level = level;
        }
        if let Some(format) = var("SOLLINT_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    fn validate_config(config: &SollintConfig) -> Result<(), ConfigError> {
        if config.cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache.max_entries must be greater than 0".to_string(),
            ));
        }
        if config.cache.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cache.ttl_secs must be greater than 0".to_string(),
            ));
        }
        if config.scheduler.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.max_concurrency must be greater than 0".to_string(),
            ));
        }
        if config.watch.extensions.is_empty() {
            return Err(ConfigError::ValidationError(
                "watch.extensions must list at least one extension".to_string(),
            ));
        }

        // RUST_LOG may carry full directives ("sollint=debug,notify=warn"), only
        // bare levels are checked.
        let level = config.logging.level.as_str();
        if !level.contains('=') && !level.contains(',') {
            match level {
                "trace" | "debug" | "info" | "warn" | "error" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                        other
                    )))
                }
            }
        }

        match config.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &SollintConfig {
        &self.config
    }

    /// Get the path to the config file that was loaded, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Log where the configuration came from. Loading happens before the
    /// subscriber exists, so callers report it once logging is set up.
    pub fn log_source(&self) {
        match &self.config_path {
            Some(path) => info!(path = %path.display(), "Configuration loaded"),
            None => info!("No config file found, using defaults"),
        }
    }

    /// Create a default config file
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = SollintConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::ReadError(e.to_string()))?;
            }
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}
