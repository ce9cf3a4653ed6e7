use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub type TaskFuture<O> = BoxFuture<'static, anyhow::Result<O>>;

/// One unit of work: an identifier, an input and the function that turns
/// the input into an output or an error.
pub struct PoolTask<I, O> {
    pub id: String,
    pub input: I,
    work: Box<dyn FnOnce(I) -> TaskFuture<O> + Send>,
}

impl<I, O> PoolTask<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F, Fut>(id: impl Into<String>, input: I, work: F) -> Self
    where
        F: FnOnce(I) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        Self {
            id: id.into(),
            input,
            work: Box::new(move |input| Box::pin(work(input))),
        }
    }

    pub(crate) fn run(self) -> TaskFuture<O> {
        (self.work)(self.input)
    }
}

impl<I: fmt::Debug, O> fmt::Debug for PoolTask<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolTask")
            .field("id", &self.id)
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

/// Outcome of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult<O> {
    pub task_id: String,
    pub success: bool,
    pub output: Option<O>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl<O> TaskResult<O> {
    pub fn success(task_id: String, output: O, duration: Duration) -> Self {
        Self {
            task_id,
            success: true,
            output: Some(output),
            error: None,
            duration,
        }
    }

    pub fn failure(task_id: String, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            task_id,
            success: false,
            output: None,
            error: Some(error.into()),
            duration,
        }
    }
}

/// Passed to the progress callback once per finished task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub completed: usize,
    pub total: usize,
    pub task_id: String,
}
