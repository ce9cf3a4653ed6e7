use std::path::PathBuf;
use std::time::Duration;

use sollint_core::WatchConfig;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    elapsed_ms, wait_until, ChangeAggregator, ChangeWatcher, FileChangeEvent, WatchError,
    WatchEvent, WatcherOptions, WatcherStats,
};

pub type ChangeHandler = Box<dyn FnMut(Vec<FileChangeEvent>) + Send>;
pub type ReadyHandler = Box<dyn FnOnce(usize) + Send>;

pub struct WatchModeOptions {
    pub patterns: Vec<PathBuf>,
    pub watcher: WatcherOptions,
    pub aggregation_window: Duration,
    pub aggregate_changes: bool,
    pub on_change: ChangeHandler,
    pub on_ready: Option<ReadyHandler>,
}

impl WatchModeOptions {
    pub fn new(patterns: Vec<PathBuf>, on_change: ChangeHandler) -> Self {
        Self {
            patterns,
            watcher: WatcherOptions::default(),
            aggregation_window: Duration::from_millis(500),
            aggregate_changes: true,
            on_change,
            on_ready: None,
        }
    }

    pub fn with_config(mut self, config: &WatchConfig) -> Self {
        self.watcher = WatcherOptions::from(config);
        self.aggregation_window = Duration::from_millis(config.aggregation_window_ms);
        self.aggregate_changes = config.aggregate_changes;
        self
    }

    pub fn on_ready(mut self, handler: ReadyHandler) -> Self {
        self.on_ready = Some(handler);
        self
    }
}

/// A running watcher plus the task that turns its events into callbacks.
pub struct WatchSession {
    watcher: ChangeWatcher,
    shutdown: oneshot::Sender<()>,
    dispatcher: JoinHandle<()>,
}

impl WatchSession {
    pub fn watcher(&self) -> &ChangeWatcher {
        &self.watcher
    }

    pub fn watcher_mut(&mut self) -> &mut ChangeWatcher {
        &mut self.watcher
    }

    pub fn stats(&self) -> WatcherStats {
        self.watcher.stats()
    }

    /// Stop watching. Changes already reported by the watcher are still
    /// delivered, including a partially filled batch.
    pub async fn close(mut self) {
        self.watcher.close().await;
        let _ = self.shutdown.send(());
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "Change dispatcher ended abnormally");
        }
    }
}

/// Watch `patterns` and hand batches of changes to `on_change`.
///
/// With aggregation on, every change inside one window (opened by the first
/// change after a quiet period) is delivered as one batch holding the latest
/// change per file. With aggregation off every change is delivered alone.
pub async fn watch_mode(options: WatchModeOptions) -> Result<WatchSession, WatchError> {
    let WatchModeOptions {
        patterns,
        watcher,
        aggregation_window,
        aggregate_changes,
        on_change,
        on_ready,
    } = options;

    let (mut watcher, events) = ChangeWatcher::new(watcher)?;
    let (shutdown, shutdown_rx) = oneshot::channel();
    let dispatcher = tokio::spawn(dispatch(
        events,
        shutdown_rx,
        aggregate_changes.then(|| ChangeAggregator::new(aggregation_window)),
        on_change,
        on_ready,
    ));

    if let Err(e) = watcher.watch(&patterns).await {
        dispatcher.abort();
        return Err(e);
    }

    Ok(WatchSession {
        watcher,
        shutdown,
        dispatcher,
    })
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    mut shutdown: oneshot::Receiver<()>,
    mut aggregator: Option<ChangeAggregator>,
    mut on_change: ChangeHandler,
    mut on_ready: Option<ReadyHandler>,
) {
    let base = Instant::now();

    loop {
        let deadline = aggregator
            .as_ref()
            .and_then(ChangeAggregator::deadline)
            .map(|ms| base + Duration::from_millis(ms));

        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(event) => handle_event(
                    event,
                    aggregator.as_mut(),
                    &mut on_change,
                    &mut on_ready,
                    elapsed_ms(base),
                ),
                None => break,
            },
            _ = wait_until(deadline) => {
                if let Some(batch) = aggregator
                    .as_mut()
                    .and_then(|aggregator| aggregator.take_due(elapsed_ms(base)))
                {
                    debug!(files = batch.len(), "Delivering change batch");
                    on_change(batch);
                }
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        handle_event(
            event,
            aggregator.as_mut(),
            &mut on_change,
            &mut on_ready,
            elapsed_ms(base),
        );
    }
    if let Some(batch) = aggregator.as_mut().and_then(ChangeAggregator::flush) {
        on_change(batch);
    }
}

fn handle_event(
    event: WatchEvent,
    aggregator: Option<&mut ChangeAggregator>,
    on_change: &mut ChangeHandler,
    on_ready: &mut Option<ReadyHandler>,
    now: u64,
) {
    match event {
        WatchEvent::Ready { files_watched } => {
            if let Some(handler) = on_ready.take() {
                handler(files_watched);
            }
        }
        WatchEvent::Change(change) => match aggregator {
            Some(aggregator) => aggregator.push(change, now),
            None => on_change(vec![change]),
        },
        WatchEvent::Error { message, paths } => {
            warn!(error = %message, paths = ?paths, "Watcher reported an error");
        }
    }
}
