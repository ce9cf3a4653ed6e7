use serde_json::{json, Value};
use sollint_cache::{CacheOptions, CacheStorage, ResultCache};
use sollint_core::{ManualClock, SollintError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const T0: u64 = 1_700_000_000_000;

fn persistent_cache(dir: &Path, ttl: Duration, clock: Arc<ManualClock>) -> ResultCache<Value> {
    ResultCache::new(CacheOptions {
        cache_directory: dir.to_path_buf(),
        ttl,
        max_entries: 100,
        use_file_system: true,
    })
    .with_clock(clock)
}

#[tokio::test]
async fn test_cache_persistence_round_trip() {
    let dir = TempDir::new().unwrap();
    let cache_dir = dir.path().join("nested").join("cache");
    let clock = Arc::new(ManualClock::new(T0));
    let result = json!({"issues": [{"rule": "reentrancy", "line": 12}]});

    let mut a = persistent_cache(&cache_dir, Duration::from_secs(60), clock.clone());
    a.set("/p/Vault.sol", "contract Vault {}", "cfg", result.clone());
    a.save().await.unwrap();

    let storage = CacheStorage::new(&cache_dir);
    assert!(storage.entries_path().exists());
    assert!(storage.metadata_path().exists());

    let mut b = persistent_cache(&cache_dir, Duration::from_secs(60), clock);
    assert_eq!(b.load().await.unwrap(), 1);
    assert_eq!(b.get("/p/Vault.sol", "contract Vault {}", "cfg"), Some(result));
}

#[tokio::test]
async fn test_load_skips_entries_expired_under_loading_ttl() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let mut a = persistent_cache(dir.path(), Duration::from_secs(60), clock.clone());
    a.set("/old.sol", "old", "cfg", json!("old"));
    clock.advance(Duration::from_secs(30));
    a.set("/new.sol", "new", "cfg", json!("new"));
    a.save().await.unwrap();

    // 40s later: /old.sol is 70s old, /new.sol is 40s old.
    clock.advance(Duration::from_secs(40));
    let mut b = persistent_cache(dir.path(), Duration::from_secs(60), clock.clone());
    assert_eq!(b.load().await.unwrap(), 1);
    assert!(!b.has("/old.sol", "old", "cfg"));
    assert!(b.has("/new.sol", "new", "cfg"));

    // A shorter TTL on the loading side drops both.
    let mut c = persistent_cache(dir.path(), Duration::from_secs(10), clock);
    assert_eq!(c.load().await.unwrap(), 0);
    assert!(c.is_empty());
}

#[tokio::test]
async fn test_load_restores_hit_statistics() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let mut a = persistent_cache(dir.path(), Duration::from_secs(60), clock.clone());
    a.set("/a.sol", "src", "cfg", json!(1));
    assert!(a.get("/a.sol", "src", "cfg").is_some());
    assert!(a.get("/b.sol", "src", "cfg").is_none());
    a.save().await.unwrap();

    let mut b = persistent_cache(dir.path(), Duration::from_secs(60), clock);
    b.load().await.unwrap();
    assert_eq!(b.hit_rate(), 0.5);
}

#[tokio::test]
async fn test_load_from_missing_directory_is_empty() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let mut cache = persistent_cache(&dir.path().join("never-created"), Duration::from_secs(60), clock);

    assert_eq!(cache.load().await.unwrap(), 0);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_save_to_unwritable_location_fails() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let mut cache = persistent_cache(&blocker.join("cache"), Duration::from_secs(60), clock);
    cache.set("/a.sol", "src", "cfg", json!(1));

    let err = cache.save().await.unwrap_err();
    assert!(matches!(err, SollintError::Io(_)));
}

#[tokio::test]
async fn test_delete_cache_removes_artifacts() {
    let dir = TempDir::new().unwrap();
    let cache_dir = dir.path().join("cache");
    let clock = Arc::new(ManualClock::new(T0));

    let mut cache = persistent_cache(&cache_dir, Duration::from_secs(60), clock.clone());
    cache.set("/a.sol", "src", "cfg", json!(1));
    cache.save().await.unwrap();
    cache.delete_cache().await.unwrap();

    let storage = CacheStorage::new(&cache_dir);
    assert!(!storage.entries_path().exists());
    assert!(!storage.metadata_path().exists());

    // Deleting twice is fine.
    cache.delete_cache().await.unwrap();

    let mut fresh = persistent_cache(&cache_dir, Duration::from_secs(60), clock);
    assert_eq!(fresh.load().await.unwrap(), 0);
}

#[tokio::test]
async fn test_memory_only_cache_never_touches_disk() {
    let dir = TempDir::new().unwrap();
    let cache_dir = dir.path().join("cache");
    let mut cache: ResultCache<Value> = ResultCache::new(CacheOptions {
        cache_directory: cache_dir.clone(),
        use_file_system: false,
        ..CacheOptions::default()
    });
    cache.set("/a.sol", "src", "cfg", json!(1));

    cache.save().await.unwrap();
    assert!(!cache_dir.exists());
    assert_eq!(cache.load().await.unwrap(), 0);
}
