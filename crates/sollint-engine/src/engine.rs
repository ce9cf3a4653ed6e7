use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use sollint_cache::{hash_config, CacheOptions, CacheStats, ResultCache};
use sollint_core::{Clock, Result, SollintConfig, SollintError};
use sollint_scheduler::{PoolTask, SchedulerOptions, TaskScheduler};
use sollint_watch::{ChangeType, FileChangeEvent};
use tracing::{debug, info, warn};

use crate::Analyzer;

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub cache: CacheOptions,
    pub scheduler: SchedulerOptions,
}

impl From<&SollintConfig> for EngineOptions {
    fn from(config: &SollintConfig) -> Self {
        Self {
            cache: CacheOptions::from(&config.cache),
            scheduler: SchedulerOptions::from(&config.scheduler),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Cached,
    Analyzed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport<O> {
    pub path: PathBuf,
    pub status: FileStatus,
    pub output: Option<O>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl<O> FileReport<O> {
    fn cached(path: PathBuf, output: O) -> Self {
        Self {
            path,
            status: FileStatus::Cached,
            output: Some(output),
            error: None,
            duration: Duration::ZERO,
        }
    }

    fn analyzed(path: PathBuf, output: O, duration: Duration) -> Self {
        Self {
            path,
            status: FileStatus::Analyzed,
            output: Some(output),
            error: None,
            duration,
        }
    }

    fn failed(path: PathBuf, error: String, duration: Duration) -> Self {
        Self {
            path,
            status: FileStatus::Failed,
            output: None,
            error: Some(error),
            duration,
        }
    }
}

/// Per-file outcomes in request order, plus counts by status.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport<O> {
    pub files: Vec<FileReport<O>>,
    pub cached: usize,
    pub analyzed: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl<O> AnalysisReport<O> {
    fn new(files: Vec<FileReport<O>>, duration: Duration) -> Self {
        let count = |status| files.iter().filter(|f| f.status == status).count();
        Self {
            cached: count(FileStatus::Cached),
            analyzed: count(FileStatus::Analyzed),
            failed: count(FileStatus::Failed),
            files,
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Runs an [`Analyzer`] over files, serving unchanged files from the result
/// cache and scheduling the rest with bounded concurrency.
///
/// A cached result is reused only while the file's content and the rule
/// configuration both match what produced it.
pub struct AnalysisEngine<A: Analyzer> {
    analyzer: Arc<A>,
    cache: ResultCache<A::Output>,
    scheduler: SchedulerOptions,
    rule_config: Value,
    config_hash: String,
}

impl<A: Analyzer> AnalysisEngine<A> {
    pub fn new(analyzer: A, rule_config: Value, options: EngineOptions) -> Result<Self> {
        let config_hash = hash_config(&rule_config)?;
        Ok(Self {
            analyzer: Arc::new(analyzer),
            cache: ResultCache::new(options.cache),
            scheduler: options.scheduler,
            rule_config,
            config_hash,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.cache = self.cache.with_clock(clock);
        self
    }

    pub fn rule_config(&self) -> &Value {
        &self.rule_config
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// Replace the rule configuration. Results cached under the old one stop
    /// matching.
    pub fn set_rule_config(&mut self, rule_config: Value) -> Result<()> {
        let config_hash = hash_config(&rule_config)?;
        if config_hash != self.config_hash {
            debug!(old = %self.config_hash, new = %config_hash, "Rule configuration changed");
        }
        self.rule_config = rule_config;
        self.config_hash = config_hash;
        Ok(())
    }

    pub async fn load_cache(&mut self) -> Result<usize> {
        self.cache.load().await
    }

    pub async fn save_cache(&self) -> Result<()> {
        self.cache.save().await
    }

    pub fn cache(&self) -> &ResultCache<A::Output> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn analyze_files<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
    ) -> Result<AnalysisReport<A::Output>> {
        let started = Instant::now();
        let mut slots: Vec<Option<FileReport<A::Output>>> = (0..paths.len()).map(|_| None).collect();
        let mut pending: Vec<(usize, PathBuf, String)> = Vec::new();
        let scheduler = TaskScheduler::new(self.scheduler.clone());

        for (index, path) in paths.iter().enumerate() {
            let path = path.as_ref().to_path_buf();
            let source = match tokio::fs::read_to_string(&path).await {
                Ok(source) => source,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read source file");
                    slots[index] = Some(FileReport::failed(
                        path,
                        format!("Failed to read file: {e}"),
                        Duration::ZERO,
                    ));
                    continue;
                }
            };

            if let Some(output) = self.cache.get(&path, &source, &self.config_hash) {
                debug!(path = %path.display(), "Serving analysis from cache");
                slots[index] = Some(FileReport::cached(path, output));
                continue;
            }

            let analyzer = Arc::clone(&self.analyzer);
            scheduler.add_task(PoolTask::new(
                index.to_string(),
                (path.clone(), source.clone()),
                move |(path, source): (PathBuf, String)| async move {
                    analyzer.analyze(&path, &source).await
                },
            ));
            pending.push((index, path, source));
        }

        if !pending.is_empty() {
            let mut results = scheduler
                .execute()
                .await
                .map_err(|e| SollintError::Analysis(e.to_string()))?;

            for (index, path, source) in pending {
                let report = match results.remove(&index.to_string()) {
                    Some(result) => match (result.output, result.error) {
                        (Some(output), _) if result.success => {
                            self.cache
                                .set(&path, &source, &self.config_hash, output.clone());
                            FileReport::analyzed(path, output, result.duration)
                        }
                        (_, error) => FileReport::failed(
                            path,
                            error.unwrap_or_else(|| "Analysis failed".to_string()),
                            result.duration,
                        ),
                    },
                    None => FileReport::failed(
                        path,
                        "Analysis was not run".to_string(),
                        Duration::ZERO,
                    ),
                };
                slots[index] = Some(report);
            }
        }

        let report = AnalysisReport::new(slots.into_iter().flatten().collect(), started.elapsed());
        if report.analyzed > 0 {
            self.persist().await;
        }

        info!(
            target: "sollint::engine",
            files = report.files.len(),
            cached = report.cached,
            analyzed = report.analyzed,
            failed = report.failed,
            elapsed_ms = report.duration.as_millis() as u64,
            "Analysis finished"
        );
        Ok(report)
    }

    /// React to a batch of file changes: forget removed files and analyze
    /// added or changed ones, each once.
    pub async fn handle_changes(
        &mut self,
        changes: &[FileChangeEvent],
    ) -> Result<AnalysisReport<A::Output>> {
        let mut targets: Vec<PathBuf> = Vec::new();
        let mut invalidated = 0usize;

        for change in changes {
            match change.change_type {
                ChangeType::Remove => {
                    self.cache.invalidate(&change.file_path);
                    targets.retain(|path| path != &change.file_path);
                    invalidated += 1;
                }
                ChangeType::Add | ChangeType::Change => {
                    if !targets.contains(&change.file_path) {
                        targets.push(change.file_path.clone());
                    }
                }
            }
        }

        debug!(
            changes = changes.len(),
            invalidated,
            reanalyze = targets.len(),
            "Handling file changes"
        );

        let report = self.analyze_files(&targets).await?;
        if invalidated > 0 && report.analyzed == 0 {
            self.persist().await;
        }
        Ok(report)
    }

    async fn persist(&self) {
        if !self.cache.options().use_file_system {
            return;
        }
        if let Err(e) = self.cache.save().await {
            warn!(
                dir = %self.cache.options().cache_directory.display(),
                error = %e,
                "Failed to save analysis cache"
            );
        }
    }
}
