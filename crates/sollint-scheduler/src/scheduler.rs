use crate::task::{PoolTask, TaskProgress, TaskResult};
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use sollint_core::SchedulerConfig;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler is already processing a batch")]
    AlreadyProcessing,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_concurrency: usize,
    pub stop_on_error: bool,
    pub task_timeout: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().max(1),
            stop_on_error: false,
            task_timeout: None,
        }
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            stop_on_error: config.stop_on_error,
            task_timeout: (config.task_timeout_ms > 0)
                .then(|| Duration::from_millis(config.task_timeout_ms)),
        }
    }
}

/// Aggregate counters, kept across `execute` calls until `reset`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    /// Mean duration of successfully completed tasks
    pub average_duration: Duration,
}

#[derive(Debug, Default)]
struct StatsState {
    total: usize,
    running: usize,
    completed: usize,
    failed: usize,
    completed_duration: Duration,
}

type ProgressCallback = Arc<dyn Fn(TaskProgress) + Send + Sync>;

/// Runs queued tasks with at most `max_concurrency` in flight.
///
/// Task failures, panics and timeouts become failed [`TaskResult`]s and never
/// escape `execute`. `stop` only prevents new dispatch; running work is left
/// to finish, and a timed-out task is dropped rather than interrupted
/// mid-poll.
pub struct TaskScheduler<I, O> {
    options: SchedulerOptions,
    queue: Mutex<VecDeque<PoolTask<I, O>>>,
    stats: Mutex<StatsState>,
    processing: AtomicBool,
    stop_requested: AtomicBool,
    progress: Mutex<Option<ProgressCallback>>,
}

impl<I, O> TaskScheduler<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(mut options: SchedulerOptions) -> Self {
        options.max_concurrency = options.max_concurrency.max(1);
        Self {
            options,
            queue: Mutex::new(VecDeque::new()),
            stats: Mutex::new(StatsState::default()),
            processing: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            progress: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn add_task(&self, task: PoolTask<I, O>) {
        let mut queue = self.queue.lock();
        queue.push_back(task);
        self.stats.lock().total += 1;
        counter!("scheduler_tasks_added").increment(1);
        gauge!("scheduler_queue_size").set(queue.len() as f64);
    }

    pub fn add_tasks(&self, tasks: impl IntoIterator<Item = PoolTask<I, O>>) {
        for task in tasks {
            self.add_task(task);
        }
    }

    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: Fn(TaskProgress) + Send + Sync + 'static,
    {
        *self.progress.lock() = Some(Arc::new(callback));
    }

    /// Ask the running batch to stop dispatching. In-flight tasks finish.
    pub fn stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("Scheduler stop requested");
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Clear the queue and all statistics.
    pub fn reset(&self) {
        self.queue.lock().clear();
        *self.stats.lock() = StatsState::default();
        gauge!("scheduler_queue_size").set(0.0);
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self.queue.lock().len();
        let state = self.stats.lock();
        let average_duration = if state.completed == 0 {
            Duration::ZERO
        } else {
            state.completed_duration / state.completed as u32
        };
        PoolStats {
            total: state.total,
            queued,
            running: state.running,
            completed: state.completed,
            failed: state.failed,
            average_duration,
        }
    }

    /// Drain the queue and wait for every dispatched task.
    ///
    /// Tasks left undispatched by `stop` or `stop_on_error` stay queued and
    /// are absent from the returned map. Dropping the returned future aborts
    /// the in-flight tasks; they are counted as failed and are not requeued.
    pub async fn execute(&self) -> Result<HashMap<String, TaskResult<O>>, SchedulerError> {
        if self.processing.swap(true, Ordering::SeqCst) {
            warn!("execute() called while a batch is already running");
            return Err(SchedulerError::AlreadyProcessing);
        }
        let mut batch = BatchGuard {
            processing: &self.processing,
            stats: &self.stats,
            in_flight: 0,
        };
        self.stop_requested.store(false, Ordering::SeqCst);

        let total = self.queue.lock().len();
        let progress = self.progress.lock().clone();
        let started = Instant::now();
        info!(
            tasks = total,
            max_concurrency = self.options.max_concurrency,
            "Executing task batch"
        );

        let mut results = HashMap::with_capacity(total);
        let mut in_flight = JoinSet::new();
        let mut failure_seen = false;
        let mut finished = 0usize;

        loop {
            while in_flight.len() < self.options.max_concurrency && !self.halted(failure_seen) {
                let Some(task) = self.queue.lock().pop_front() else {
                    break;
                };
                debug!(task_id = %task.id, "Dispatching task");
                self.stats.lock().running += 1;
                batch.in_flight += 1;
                in_flight.spawn(run_task(task, self.options.task_timeout));
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            batch.in_flight -= 1;
            {
                let mut stats = self.stats.lock();
                stats.running = stats.running.saturating_sub(1);
            }

            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    // run_task catches panics, so only cancellation lands here.
                    error!(error = %e, "Task join failed");
                    self.stats.lock().failed += 1;
                    failure_seen = true;
                    continue;
                }
            };

            self.record(&result);
            if !result.success {
                failure_seen = true;
                warn!(
                    task_id = %result.task_id,
                    error = result.error.as_deref().unwrap_or(""),
                    "Task failed"
                );
            }

            finished += 1;
            if let Some(callback) = &progress {
                callback(TaskProgress {
                    completed: finished,
                    total,
                    task_id: result.task_id.clone(),
                });
            }
            results.insert(result.task_id.clone(), result);
        }

        let skipped = total.saturating_sub(finished);
        gauge!("scheduler_queue_size").set(self.queue.lock().len() as f64);
        histogram!("scheduler_batch_duration").record(started.elapsed());
        info!(
            finished,
            skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task batch finished"
        );

        Ok(results)
    }

    fn halted(&self, failure_seen: bool) -> bool {
        self.stop_requested.load(Ordering::SeqCst) || (self.options.stop_on_error && failure_seen)
    }

    fn record(&self, result: &TaskResult<O>) {
        let mut stats = self.stats.lock();
        if result.success {
            stats.completed += 1;
            stats.completed_duration += result.duration;
            counter!("scheduler_tasks_completed").increment(1);
        } else {
            stats.failed += 1;
            counter!("scheduler_tasks_failed").increment(1);
        }
        histogram!("scheduler_task_duration").record(result.duration);
    }
}

/// Releases the re-entrancy flag and settles the counters of tasks still in
/// flight when `execute` is cancelled.
struct BatchGuard<'a> {
    processing: &'a AtomicBool,
    stats: &'a Mutex<StatsState>,
    in_flight: usize,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.in_flight > 0 {
            let mut stats = self.stats.lock();
            stats.running = stats.running.saturating_sub(self.in_flight);
            stats.failed += self.in_flight;
            warn!(aborted = self.in_flight, "Task batch cancelled with tasks in flight");
        }
        self.processing.store(false, Ordering::SeqCst);
    }
}

async fn run_task<I, O>(task: PoolTask<I, O>, timeout: Option<Duration>) -> TaskResult<O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let id = task.id.clone();
    let started = Instant::now();
    let work = AssertUnwindSafe(async move { task.run().await }).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return TaskResult::failure(
                    id.clone(),
                    format!("Task {} timed out after {}ms", id, limit.as_millis()),
                    started.elapsed(),
                );
            }
        },
        None => work.await,
    };

    let duration = started.elapsed();
    match outcome {
        Ok(Ok(output)) => TaskResult::success(id, output, duration),
        Ok(Err(e)) => TaskResult::failure(id, format!("{:#}", e), duration),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            TaskResult::failure(id, format!("Task panicked: {}", message), duration)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn options(max_concurrency: usize) -> SchedulerOptions {
        SchedulerOptions {
            max_concurrency,
            ..SchedulerOptions::default()
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let scheduler: TaskScheduler<u32, u32> = TaskScheduler::new(options(2));
        for i in 1..=3u32 {
            scheduler.add_task(PoolTask::new(format!("t{}", i), i, |n| async move {
                if n == 2 {
                    anyhow::bail!("boom on {}", n);
                }
                Ok(n * 10)
            }));
        }

        let results = scheduler.execute().await.unwrap();

        assert_eq!(results.len(), 3);
        assert!(results["t1"].success);
        assert_eq!(results["t1"].output, Some(10));
        assert!(!results["t2"].success);
        assert!(results["t2"].error.as_deref().unwrap().contains("boom on 2"));
        assert!(results["t3"].success);

        let stats = scheduler.stats();
        assert_eq!((stats.total, stats.completed, stats.failed), (3, 2, 1));
        assert_eq!((stats.queued, stats.running), (0, 0));
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_failure() {
        let scheduler: TaskScheduler<(), ()> = TaskScheduler::new(options(1));
        scheduler.add_task(PoolTask::new("bad", (), |_| async move {
            let explode = true;
            if explode {
                panic!("rule exploded");
            }
            Ok(())
        }));
        scheduler.add_task(PoolTask::new("good", (), |_| async move { Ok(()) }));

        let results = scheduler.execute().await.unwrap();
        assert!(!results["bad"].success);
        assert!(results["bad"].error.as_deref().unwrap().contains("rule exploded"));
        assert!(results["good"].success);
    }

    #[tokio::test]
    async fn test_progress_follows_completion() {
        let scheduler: TaskScheduler<u64, u64> = TaskScheduler::new(options(3));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        scheduler.set_progress_callback(move |p| sink.lock().push(p));

        for (id, delay) in [("slow", 80u64), ("fast", 5), ("medium", 40)] {
            scheduler.add_task(PoolTask::new(id, delay, |ms| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            }));
        }
        scheduler.execute().await.unwrap();

        let seen = seen.lock();
        let ids: Vec<&str> = seen.iter().map(|p| p.task_id.as_str()).collect();
        assert_eq!(ids, vec!["fast", "medium", "slow"]);
        assert_eq!(
            seen.iter().map(|p| p.completed).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(seen.iter().all(|p| p.total == 3));
    }

    #[tokio::test]
    async fn test_reset_clears_queue_and_stats() {
        let scheduler: TaskScheduler<(), ()> = TaskScheduler::new(options(1));
        scheduler.add_task(PoolTask::new("a", (), |_| async { Ok(()) }));
        scheduler.execute().await.unwrap();
        scheduler.add_task(PoolTask::new("b", (), |_| async { Ok(()) }));

        assert_eq!(scheduler.stats().total, 2);
        assert_eq!(scheduler.stats().queued, 1);

        scheduler.reset();
        assert_eq!(scheduler.stats(), PoolStats::default());
        assert!(scheduler.execute().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_accumulate_across_batches() {
        let scheduler: TaskScheduler<(), ()> = TaskScheduler::new(options(2));
        let runs = Arc::new(AtomicUsize::new(0));
        for batch in 0..2 {
            for i in 0..2 {
                let runs = runs.clone();
                scheduler.add_task(PoolTask::new(format!("{}-{}", batch, i), (), move |_| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
            scheduler.execute().await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.stats().completed, 4);
    }

    #[tokio::test]
    async fn test_cancelled_batch_settles_running_tasks() {
        let scheduler: TaskScheduler<(), ()> = TaskScheduler::new(options(2));
        for id in ["a", "b", "c"] {
            scheduler.add_task(PoolTask::new(id, (), |_| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }));
        }

        let outcome = tokio::time::timeout(Duration::from_millis(50), scheduler.execute()).await;
        assert!(outcome.is_err());

        let stats = scheduler.stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.queued, 1);
        assert!(!scheduler.is_processing());
    }

    #[test]
    fn test_options_from_config() {
        let config = SchedulerConfig {
            max_concurrency: 0,
            stop_on_error: true,
            task_timeout_ms: 0,
        };
        let options = SchedulerOptions::from(&config);
        assert_eq!(options.max_concurrency, 1);
        assert!(options.stop_on_error);
        assert_eq!(options.task_timeout, None);
    }
}
