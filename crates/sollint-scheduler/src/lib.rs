pub mod scheduler;
pub mod task;

pub use scheduler::*;
pub use task::*;

use std::future::Future;
use std::sync::Arc;

/// Run `f` over every item with bounded concurrency.
///
/// Each item becomes a task addressed by its index; the returned results are
/// in input order no matter which task finished first. Items skipped because
/// of `stop_on_error` are left out.
pub async fn parallel<T, O, F, Fut>(
    items: Vec<T>,
    f: F,
    options: SchedulerOptions,
) -> Result<Vec<TaskResult<O>>, SchedulerError>
where
    T: Send + 'static,
    O: Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
{
    let f = Arc::new(f);
    let count = items.len();
    let scheduler = TaskScheduler::new(options);

    for (index, item) in items.into_iter().enumerate() {
        let f = Arc::clone(&f);
        scheduler.add_task(PoolTask::new(index.to_string(), item, move |item| {
            f(item, index)
        }));
    }

    let mut results = scheduler.execute().await?;
    Ok((0..count)
        .filter_map(|index| results.remove(&index.to_string()))
        .collect())
}
