use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sollint_cache::CacheOptions;
use sollint_engine::{async_trait, AnalysisEngine, Analyzer, EngineOptions, FileStatus};
use sollint_scheduler::SchedulerOptions;
use sollint_watch::{ChangeType, FileChangeEvent};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Findings {
    contracts: usize,
    lines: usize,
}

#[derive(Default)]
struct CountingAnalyzer {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Analyzer for CountingAnalyzer {
    type Output = Findings;

    async fn analyze(&self, path: &Path, source: &str) -> anyhow::Result<Findings> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if source.contains("FAIL") {
            anyhow::bail!("cannot parse {}", path.display());
        }
        Ok(Findings {
            contracts: source.matches("contract").count(),
            lines: source.lines().count(),
        })
    }
}

fn rules() -> serde_json::Value {
    json!({ "rules": { "no-empty-blocks": "warn", "max-line-length": 120 } })
}

fn options() -> EngineOptions {
    EngineOptions {
        cache: CacheOptions::default(),
        scheduler: SchedulerOptions {
            max_concurrency: 2,
            ..SchedulerOptions::default()
        },
    }
}

fn engine(options: EngineOptions) -> (AnalysisEngine<CountingAnalyzer>, Arc<AtomicUsize>) {
    let analyzer = CountingAnalyzer::default();
    let calls = Arc::clone(&analyzer.calls);
    (AnalysisEngine::new(analyzer, rules(), options).unwrap(), calls)
}

fn write(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, source).unwrap();
    path
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "A.sol", "contract A {}\ncontract A2 {}");
    let b = write(dir.path(), "B.sol", "contract B {}");
    let (mut engine, calls) = engine(options());

    let first = engine.analyze_files(&[&a, &b]).await.unwrap();
    assert_eq!((first.analyzed, first.cached, first.failed), (2, 0, 0));
    assert_eq!(
        first.files[0].output,
        Some(Findings {
            contracts: 2,
            lines: 2
        })
    );

    let second = engine.analyze_files(&[&a, &b]).await.unwrap();
    assert_eq!((second.analyzed, second.cached), (0, 2));
    assert!(second.files.iter().all(|f| f.status == FileStatus::Cached));
    assert_eq!(second.files[0].output, first.files[0].output);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = engine.cache_stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.hits, 2);
}

#[tokio::test]
async fn reports_follow_input_order() {
    let dir = TempDir::new().unwrap();
    let paths: Vec<PathBuf> = (0..6)
        .map(|i| write(dir.path(), &format!("C{i}.sol"), &"contract X {}\n".repeat(i + 1)))
        .collect();
    let (mut engine, _) = engine(options());

    engine.analyze_files(&paths[2..4]).await.unwrap();
    let report = engine.analyze_files(&paths).await.unwrap();

    let reported: Vec<&PathBuf> = report.files.iter().map(|f| &f.path).collect();
    assert_eq!(reported, paths.iter().collect::<Vec<_>>());
    assert_eq!((report.cached, report.analyzed), (2, 4));
    for (i, file) in report.files.iter().enumerate() {
        assert_eq!(file.output.as_ref().map(|o| o.lines), Some(i + 1));
    }
}

#[tokio::test]
async fn content_change_invalidates_one_file() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "A.sol", "contract A {}");
    let b = write(dir.path(), "B.sol", "contract B {}");
    let (mut engine, calls) = engine(options());
    engine.analyze_files(&[&a, &b]).await.unwrap();

    write(dir.path(), "A.sol", "contract A {}\ncontract Extra {}");
    let report = engine.analyze_files(&[&a, &b]).await.unwrap();

    assert_eq!(report.files[0].status, FileStatus::Analyzed);
    assert_eq!(report.files[1].status, FileStatus::Cached);
    assert_eq!(report.files[0].output.as_ref().map(|o| o.contracts), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rule_config_change_invalidates_everything() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "A.sol", "contract A {}");
    let b = write(dir.path(), "B.sol", "contract B {}");
    let (mut engine, calls) = engine(options());
    engine.analyze_files(&[&a, &b]).await.unwrap();

    // Key order does not change the fingerprint
    let before = engine.config_hash().to_string();
    engine
        .set_rule_config(json!({ "rules": { "max-line-length": 120, "no-empty-blocks": "warn" } }))
        .unwrap();
    assert_eq!(engine.config_hash(), before);
    assert_eq!(engine.analyze_files(&[&a, &b]).await.unwrap().cached, 2);

    engine
        .set_rule_config(json!({ "rules": { "max-line-length": 80 } }))
        .unwrap();
    let report = engine.analyze_files(&[&a, &b]).await.unwrap();
    assert_eq!((report.analyzed, report.cached), (2, 0));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn failures_are_reported_and_not_cached() {
    let dir = TempDir::new().unwrap();
    let good = write(dir.path(), "Good.sol", "contract Good {}");
    let bad = write(dir.path(), "Bad.sol", "FAIL");
    let missing = dir.path().join("Missing.sol");
    let (mut engine, calls) = engine(options());

    let report = engine.analyze_files(&[&good, &bad, &missing]).await.unwrap();
    assert_eq!((report.analyzed, report.failed), (1, 2));
    assert!(!report.is_success());
    assert_eq!(report.files[1].status, FileStatus::Failed);
    assert!(report.files[1]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("cannot parse")));
    assert!(report.files[2]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Failed to read file")));
    // The unreadable file never reaches the analyzer
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let again = engine.analyze_files(&[&good, &bad]).await.unwrap();
    assert_eq!((again.cached, again.failed), (1, 1));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn changes_invalidate_and_reanalyze() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "A.sol", "contract A {}");
    let b = write(dir.path(), "B.sol", "contract B {}");
    let (mut engine, calls) = engine(options());
    engine.analyze_files(&[&a, &b]).await.unwrap();

    write(dir.path(), "A.sol", "contract A { uint x; }\n// edited");
    std::fs::remove_file(&b).unwrap();

    let report = engine
        .handle_changes(&[
            FileChangeEvent::new(a.clone(), ChangeType::Change),
            FileChangeEvent::new(a.clone(), ChangeType::Change),
            FileChangeEvent::new(b.clone(), ChangeType::Remove),
        ])
        .await
        .unwrap();

    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].path, a);
    assert_eq!(report.analyzed, 1);
    assert_eq!(engine.cache().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn persisted_cache_survives_restart() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "A.sol", "contract A {}");
    let b = write(dir.path(), "B.sol", "contract B {}");
    let cache_dir = dir.path().join(".sollint-cache");
    let file_backed = || EngineOptions {
        cache: CacheOptions {
            cache_directory: cache_dir.clone(),
            use_file_system: true,
            ..CacheOptions::default()
        },
        ..options()
    };

    let (mut first, _) = engine(file_backed());
    first.analyze_files(&[&a, &b]).await.unwrap();
    assert!(cache_dir.join("entries.json").exists());

    let (mut second, calls) = engine(file_backed());
    assert_eq!(second.load_cache().await.unwrap(), 2);
    let report = second.analyze_files(&[&a, &b]).await.unwrap();
    assert_eq!(report.cached, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
