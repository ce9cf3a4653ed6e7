use sollint_core::{ConfigError, ConfigManager, SollintConfig};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_load_explicit_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sollint.toml");
    fs::write(
        &path,
        r#"
[cache]
directory = "/tmp/sollint-test-cache"
ttl_secs = 120
max_entries = 50

[scheduler]
max_concurrency = 2
stop_on_error = true

[watch]
extensions = ["sol", "yul"]
ignored = ["lib", "node_modules"]
"#,
    )
    .unwrap();

    let manager = ConfigManager::load(Some(&path)).unwrap();
    let config = manager.config();

    assert_eq!(manager.config_path(), Some(path.as_path()));
    assert_eq!(config.cache.max_entries, 50);
    assert_eq!(config.scheduler.max_concurrency, 2);
    assert!(config.scheduler.stop_on_error);
    assert_eq!(config.watch.extensions, vec!["sol", "yul"]);
    assert_eq!(config.watch.debounce_ms, 300);
}

#[test]
fn test_malformed_file_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[cache\nttl_secs = ").unwrap();

    let err = ConfigManager::load(Some(&path)).unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut config = SollintConfig::default();
    config.watch.extensions.clear();

    let err = ConfigManager::from_config(config).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}
