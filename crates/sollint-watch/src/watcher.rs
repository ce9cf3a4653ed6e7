use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use sollint_core::WatchConfig;
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    elapsed_ms, wait_until, ChangeType, Debouncer, FileChangeEvent, FileSignature, PathFilter,
    WatchEntry, WatchError, WatchEvent, WatcherState, WatcherStats,
};

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub debounce_delay: Duration,
    pub poll_interval: Duration,
    pub use_polling: bool,
    /// Without the leading dot
    pub extensions: Vec<String>,
    pub ignored: Vec<String>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce_delay: Duration::from_millis(300),
            poll_interval: Duration::from_millis(1000),
            use_polling: false,
            extensions: vec!["sol".to_string()],
            ignored: vec!["node_modules".to_string(), ".git".to_string()],
        }
    }
}

impl From<&WatchConfig> for WatcherOptions {
    fn from(config: &WatchConfig) -> Self {
        Self {
            debounce_delay: Duration::from_millis(config.debounce_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            use_polling: config.use_polling,
            extensions: config.extensions.clone(),
            ignored: config.ignored.clone(),
        }
    }
}

type RawEvent = notify::Result<Event>;

/// Tracked-file table shared by the public handle and the driver task.
#[derive(Debug)]
struct WatchState {
    filter: Arc<PathFilter>,
    /// Canonical watched directories
    roots: Vec<PathBuf>,
    /// Files named directly or through `add_file`; tracked regardless of the filter
    explicit: HashSet<PathBuf>,
    /// Files dropped through `remove_file`; never tracked again automatically
    excluded: HashSet<PathBuf>,
    tracked: HashMap<PathBuf, WatchEntry>,
    changes_detected: u64,
    last_change_time: Option<DateTime<Utc>>,
}

impl WatchState {
    fn new(filter: Arc<PathFilter>) -> Self {
        Self {
            filter,
            roots: Vec::new(),
            explicit: HashSet::new(),
            excluded: HashSet::new(),
            tracked: HashMap::new(),
            changes_detected: 0,
            last_change_time: None,
        }
    }

    /// Deepest watched directory containing `path`.
    fn root_for(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .map(PathBuf::as_path)
    }

    /// Worth debouncing: tracked, explicit, or somewhere not ignored below a root.
    fn is_relevant(&self, path: &Path) -> bool {
        if self.excluded.contains(path) {
            return false;
        }
        self.tracked.contains_key(path)
            || self.explicit.contains(path)
            || self
                .root_for(path)
                .is_some_and(|root| !self.filter.is_ignored(path, root))
    }

    fn is_eligible(&self, path: &Path) -> bool {
        if self.excluded.contains(path) {
            return false;
        }
        self.explicit.contains(path)
            || self
                .root_for(path)
                .is_some_and(|root| self.filter.accepts(path, root))
    }

    fn record(&mut self, path: PathBuf, change_type: ChangeType) -> FileChangeEvent {
        let event = FileChangeEvent::new(path, change_type);
        self.changes_detected += 1;
        self.last_change_time = Some(event.timestamp);
        event
    }

    /// Reconcile one settled path with what is on disk now.
    fn apply(&mut self, path: PathBuf, current: Option<FileSignature>) -> Vec<FileChangeEvent> {
        if self.excluded.contains(&path) {
            return Vec::new();
        }

        match (self.tracked.get(&path).map(|entry| entry.signature), current) {
            (Some(None), None) => Vec::new(),
            (Some(Some(_)), None) => {
                self.tracked.remove(&path);
                vec![self.record(path, ChangeType::Remove)]
            }
            (Some(None), Some(signature)) => {
                self.track(path.clone(), Some(signature));
                vec![self.record(path, ChangeType::Add)]
            }
            (Some(Some(previous)), Some(signature)) if previous != signature => {
                self.track(path.clone(), Some(signature));
                vec![self.record(path, ChangeType::Change)]
            }
            (Some(Some(_)), Some(_)) => Vec::new(),
            (None, Some(signature)) if self.is_eligible(&path) => {
                self.track(path.clone(), Some(signature));
                vec![self.record(path, ChangeType::Add)]
            }
            (None, Some(_)) => Vec::new(),
            // A vanished directory takes its tracked files with it
            (None, None) => {
                let mut gone: Vec<PathBuf> = self
                    .tracked
                    .keys()
                    .filter(|tracked| tracked.starts_with(&path))
                    .cloned()
                    .collect();
                gone.sort();
                gone.into_iter()
                    .map(|file| {
                        self.tracked.remove(&file);
                        self.record(file, ChangeType::Remove)
                    })
                    .collect()
            }
        }
    }

    /// Files found by scanning a directory that appeared after startup.
    fn discover(&mut self, found: Vec<WatchEntry>) -> Vec<FileChangeEvent> {
        let mut events = Vec::new();
        for entry in found {
            if self.tracked.contains_key(&entry.path) || self.excluded.contains(&entry.path) {
                continue;
            }
            let path = entry.path.clone();
            self.tracked.insert(path.clone(), entry);
            events.push(self.record(path, ChangeType::Add));
        }
        events
    }

    fn track(&mut self, path: PathBuf, signature: Option<FileSignature>) {
        self.tracked
            .insert(path.clone(), WatchEntry { path, signature });
    }

    fn stats(&self) -> WatcherStats {
        WatcherStats {
            files_watched: self.tracked.len(),
            changes_detected: self.changes_detected,
            last_change_time: self.last_change_time,
        }
    }
}

struct Driver {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Watches files and directories and reports debounced per-file changes.
///
/// Events go to the channel returned by [`ChangeWatcher::new`]. A raw
/// notification only starts a per-path debounce; when the path settles the
/// watcher compares the file's signature with the one it tracked and emits
/// `Add`, `Change` or `Remove` only if something actually moved.
pub struct ChangeWatcher {
    options: WatcherOptions,
    state: Arc<Mutex<WatchState>>,
    events: mpsc::UnboundedSender<WatchEvent>,
    backend: Option<Box<dyn Watcher + Send>>,
    subscribed: HashSet<PathBuf>,
    driver: Option<Driver>,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("options", &self.options)
            .field("state", &self.state())
            .field("subscribed", &self.subscribed)
            .finish()
    }
}

impl ChangeWatcher {
    pub fn new(
        options: WatcherOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>), WatchError> {
        let filter = PathFilter::new(&options.extensions, &options.ignored)?;
        let (events, receiver) = mpsc::unbounded_channel();

        Ok((
            Self {
                options,
                state: Arc::new(Mutex::new(WatchState::new(Arc::new(filter)))),
                events,
                backend: None,
                subscribed: HashSet::new(),
                driver: None,
            },
            receiver,
        ))
    }

    pub fn options(&self) -> &WatcherOptions {
        &self.options
    }

    /// Start watching. Directories are scanned recursively through the
    /// filter; files are tracked as given; paths that do not exist are
    /// skipped. Emits [`WatchEvent::Ready`] once subscribed.
    pub async fn watch<I, P>(&mut self, paths: I) -> Result<(), WatchError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        if self.driver.is_some() {
            return Err(WatchError::AlreadyRunning);
        }

        let mut roots = Vec::new();
        let mut files = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let canonical = match fs::canonicalize(path).await {
                Ok(canonical) => canonical,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping missing watch path");
                    continue;
                }
            };
            match fs::metadata(&canonical).await {
                Ok(metadata) if metadata.is_dir() => roots.push(canonical),
                Ok(metadata) => files.push(WatchEntry {
                    path: canonical,
                    signature: Some(FileSignature::from(&metadata)),
                }),
                Err(e) => {
                    debug!(path = %canonical.display(), error = %e, "Skipping unreadable watch path")
                }
            }
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut backend = self.create_backend(raw_tx)?;
        self.subscribed.clear();

        // Subscribe before scanning so nothing written during the scan is lost
        for root in &roots {
            if subscribe(backend.as_mut(), root, RecursiveMode::Recursive, &self.events) {
                self.subscribed.insert(root.clone());
            }
        }
        for file in &files {
            if let Some(parent) = file.path.parent() {
                let covered = roots.iter().any(|root| parent.starts_with(root));
                if !covered
                    && !self.subscribed.contains(parent)
                    && subscribe(
                        backend.as_mut(),
                        parent,
                        RecursiveMode::NonRecursive,
                        &self.events,
                    )
                {
                    self.subscribed.insert(parent.to_path_buf());
                }
            }
        }

        let filter = Arc::clone(&self.state.lock().filter);
        let mut scanned = Vec::new();
        for root in &roots {
            scanned.extend(scan_directory(root, root, &filter).await);
        }

        let files_watched = {
            let mut state = self.state.lock();
            // Counters are cumulative across watch sessions
            let fresh = WatchState {
                changes_detected: state.changes_detected,
                last_change_time: state.last_change_time,
                ..WatchState::new(filter)
            };
            *state = fresh;
            state.roots = roots;
            for entry in scanned {
                state.tracked.insert(entry.path.clone(), entry);
            }
            for entry in files {
                state.explicit.insert(entry.path.clone());
                state.tracked.insert(entry.path.clone(), entry);
            }
            state.tracked.len()
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_driver(
            Arc::clone(&self.state),
            raw_rx,
            shutdown_rx,
            self.events.clone(),
            self.options.debounce_delay,
        ));
        self.backend = Some(backend);
        self.driver = Some(Driver { shutdown, handle });

        info!(
            target: "sollint::watch",
            files = files_watched,
            polling = self.options.use_polling,
            "Watcher ready"
        );
        let _ = self.events.send(WatchEvent::Ready { files_watched });
        Ok(())
    }

    fn create_backend(
        &self,
        raw_tx: mpsc::UnboundedSender<RawEvent>,
    ) -> Result<Box<dyn Watcher + Send>, WatchError> {
        let handler = move |event: RawEvent| {
            let _ = raw_tx.send(event);
        };

        if !self.options.use_polling {
            match RecommendedWatcher::new(handler.clone(), Config::default()) {
                Ok(watcher) => return Ok(Box::new(watcher)),
                Err(e) => warn!(error = %e, "Native file watching unavailable, falling back to polling"),
            }
        }

        // Modification times are only compared to the second; hash contents too
        let config = Config::default()
            .with_poll_interval(self.options.poll_interval)
            .with_compare_contents(true);
        Ok(Box::new(PollWatcher::new(handler, config)?))
    }

    /// Track one more file, bypassing the extension and ignore filter.
    pub async fn add_file(&mut self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        if self.driver.is_none() {
            return Err(WatchError::NotRunning);
        }

        let path = resolve_path(path.as_ref()).await;
        let signature = fs::metadata(&path)
            .await
            .ok()
            .filter(|metadata| metadata.is_file())
            .map(|metadata| FileSignature::from(&metadata));

        let covered = {
            let mut state = self.state.lock();
            state.excluded.remove(&path);
            state.explicit.insert(path.clone());
            // A missing file is picked up as an add once it appears
            if signature.is_some() {
                state.track(path.clone(), signature);
            }
            state.root_for(&path).is_some()
        };

        if let (false, Some(parent), Some(backend)) = (covered, path.parent(), self.backend.as_mut())
        {
            if !self.subscribed.contains(parent)
                && subscribe(
                    backend.as_mut(),
                    parent,
                    RecursiveMode::NonRecursive,
                    &self.events,
                )
            {
                self.subscribed.insert(parent.to_path_buf());
            }
        }

        debug!(path = %path.display(), "File added to watch set");
        Ok(())
    }

    /// Stop tracking a file. Returns whether it was tracked.
    pub async fn remove_file(&mut self, path: impl AsRef<Path>) -> Result<bool, WatchError> {
        if self.driver.is_none() {
            return Err(WatchError::NotRunning);
        }

        let path = resolve_path(path.as_ref()).await;
        let mut state = self.state.lock();
        state.explicit.remove(&path);
        state.excluded.insert(path.clone());
        let removed = state.tracked.remove(&path).is_some();
        debug!(path = %path.display(), removed, "File removed from watch set");
        Ok(removed)
    }

    /// Drop the backend subscriptions, stop the driver task and forget the
    /// tracked files. Change counters are kept.
    pub async fn close(&mut self) {
        self.backend = None;
        self.subscribed.clear();

        if let Some(driver) = self.driver.take() {
            let _ = driver.shutdown.send(());
            if let Err(e) = driver.handle.await {
                warn!(error = %e, "Watch driver ended abnormally");
            }
            info!(target: "sollint::watch", "Watcher closed");
        }

        let mut state = self.state.lock();
        state.roots.clear();
        state.explicit.clear();
        state.excluded.clear();
        state.tracked.clear();
    }

    pub fn state(&self) -> WatcherState {
        if self.driver.is_some() {
            WatcherState::Watching
        } else {
            WatcherState::Idle
        }
    }

    pub fn is_watching(&self) -> bool {
        self.driver.is_some()
    }

    pub fn stats(&self) -> WatcherStats {
        self.state.lock().stats()
    }

    /// Tracked files, sorted.
    pub fn watched_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.state.lock().tracked.keys().cloned().collect();
        files.sort();
        files
    }
}

async fn resolve_path(path: &Path) -> PathBuf {
    match fs::canonicalize(path).await {
        Ok(canonical) => canonical,
        Err(_) => path.to_path_buf(),
    }
}

fn subscribe(
    backend: &mut (dyn Watcher + Send),
    path: &Path,
    mode: RecursiveMode,
    events: &mpsc::UnboundedSender<WatchEvent>,
) -> bool {
    match backend.watch(path, mode) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to subscribe");
            let _ = events.send(WatchEvent::Error {
                message: e.to_string(),
                paths: vec![path.to_path_buf()],
            });
            false
        }
    }
}

/// Files under `dir` that pass the filter relative to `root`. Ignored
/// directories are not descended into.
async fn scan_directory(root: &Path, dir: &Path, filter: &PathFilter) -> Vec<WatchEntry> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %current.display(), error = %e, "Cannot read directory");
                continue;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };

            if file_type.is_dir() {
                if !filter.is_ignored(&path, root) {
                    stack.push(path);
                }
            } else if filter.accepts(&path, root) {
                if let Ok(metadata) = fs::metadata(&path).await {
                    if metadata.is_file() {
                        found.push(WatchEntry {
                            signature: Some(FileSignature::from(&metadata)),
                            path,
                        });
                    }
                }
            }
        }
    }

    found
}

fn change_kind(kind: &EventKind) -> Option<ChangeType> {
    match kind {
        EventKind::Create(_) => Some(ChangeType::Add),
        EventKind::Remove(_) => Some(ChangeType::Remove),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(ChangeType::Change),
        EventKind::Access(_) => None,
    }
}

async fn run_driver(
    state: Arc<Mutex<WatchState>>,
    mut raw_events: mpsc::UnboundedReceiver<RawEvent>,
    mut shutdown: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<WatchEvent>,
    debounce_delay: Duration,
) {
    let base = Instant::now();
    let mut debouncer = Debouncer::new(debounce_delay);

    loop {
        let deadline = debouncer
            .next_deadline()
            .map(|ms| base + Duration::from_millis(ms));

        tokio::select! {
            _ = &mut shutdown => break,
            raw = raw_events.recv() => match raw {
                Some(Ok(event)) => {
                    if let Some(kind) = change_kind(&event.kind) {
                        let now = elapsed_ms(base);
                        let state = state.lock();
                        for path in event.paths {
                            if state.is_relevant(&path) {
                                debouncer.record(path, kind, now);
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, paths = ?e.paths, "File watcher error");
                    let _ = events.send(WatchEvent::Error {
                        message: e.to_string(),
                        paths: e.paths,
                    });
                }
                None => break,
            },
            _ = wait_until(deadline) => {
                for (path, kind) in debouncer.drain_due(elapsed_ms(base)) {
                    debug!(path = %path.display(), kind = %kind, "Change settled");
                    for change in settle(&state, path).await {
                        debug!(
                            path = %change.file_path.display(),
                            change = %change.change_type,
                            "File change detected"
                        );
                        let _ = events.send(WatchEvent::Change(change));
                    }
                }
            }
        }
    }

    debug!("Watch driver stopped");
}

async fn settle(state: &Mutex<WatchState>, path: PathBuf) -> Vec<FileChangeEvent> {
    match fs::metadata(&path).await {
        Ok(metadata) if metadata.is_dir() => {
            let (root, filter) = {
                let state = state.lock();
                (
                    state.root_for(&path).map(Path::to_path_buf),
                    Arc::clone(&state.filter),
                )
            };
            let Some(root) = root else {
                return Vec::new();
            };
            let found = scan_directory(&root, &path, &filter).await;
            state.lock().discover(found)
        }
        Ok(metadata) => {
            let signature = FileSignature::from(&metadata);
            state.lock().apply(path, Some(signature))
        }
        Err(_) => state.lock().apply(path, None),
    }
}
