use crate::ChangeType;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-path pending state: the merged change kind and when it may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingChange {
    pub kind: ChangeType,
    /// Unix milliseconds
    pub deadline: u64,
}

/// Trailing-edge debounce over raw change notifications.
///
/// Each notification for a path pushes that path's deadline to
/// `now + delay`; a path fires once no notification arrived for a full
/// delay. Time is passed in by the caller, which keeps the state machine
/// independent of any timer.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay_ms: u64,
    pending: HashMap<PathBuf, PendingChange>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay_ms: delay.as_millis() as u64,
            pending: HashMap::new(),
        }
    }

    pub fn record(&mut self, path: PathBuf, kind: ChangeType, now: u64) {
        let deadline = now + self.delay_ms;
        match self.pending.get(&path).map(|p| p.kind) {
            Some(previous) => match merge(previous, kind) {
                Some(kind) => {
                    self.pending.insert(path, PendingChange { kind, deadline });
                }
                None => {
                    self.pending.remove(&path);
                }
            },
            None => {
                self.pending.insert(path, PendingChange { kind, deadline });
            }
        }
    }

    pub fn cancel(&mut self, path: &Path) {
        self.pending.remove(path);
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every path whose deadline has passed, sorted by path.
    pub fn drain_due(&mut self, now: u64) -> Vec<(PathBuf, ChangeType)> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        let mut out: Vec<(PathBuf, ChangeType)> = due
            .into_iter()
            .filter_map(|path| self.pending.remove(&path).map(|p| (path, p.kind)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Fold a new notification into a pending one. `None` means the two cancel
/// out (created then deleted inside one window).
fn merge(previous: ChangeType, next: ChangeType) -> Option<ChangeType> {
    use ChangeType::*;
    match (previous, next) {
        (Add, Remove) => None,
        (Add, _) => Some(Add),
        (Remove, Add) | (Remove, Change) => Some(Change),
        (Change, Add) => Some(Change),
        (_, next) => Some(next),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn burst_collapses_to_one_change() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        d.record(p("/a.sol"), ChangeType::Change, 0);
        d.record(p("/a.sol"), ChangeType::Change, 40);
        d.record(p("/a.sol"), ChangeType::Change, 80);

        assert!(d.drain_due(150).is_empty(), "deadline moved to 180");
        assert_eq!(d.next_deadline(), Some(180));
        assert_eq!(d.drain_due(180), vec![(p("/a.sol"), ChangeType::Change)]);
        assert!(d.is_empty());
    }

    #[test]
    fn paths_are_debounced_independently() {
        let mut d = Debouncer::new(Duration::from_millis(50));
        d.record(p("/b.sol"), ChangeType::Change, 0);
        d.record(p("/a.sol"), ChangeType::Change, 30);

        assert_eq!(d.drain_due(60), vec![(p("/b.sol"), ChangeType::Change)]);
        assert!(d.is_pending(Path::new("/a.sol")));
        assert_eq!(d.drain_due(80), vec![(p("/a.sol"), ChangeType::Change)]);
    }

    #[test]
    fn kinds_merge() {
        let mut d = Debouncer::new(Duration::from_millis(10));
        d.record(p("/new.sol"), ChangeType::Add, 0);
        d.record(p("/new.sol"), ChangeType::Change, 1);
        d.record(p("/gone.sol"), ChangeType::Add, 0);
        d.record(p("/gone.sol"), ChangeType::Remove, 1);
        d.record(p("/swap.sol"), ChangeType::Remove, 0);
        d.record(p("/swap.sol"), ChangeType::Add, 1);
        d.record(p("/del.sol"), ChangeType::Change, 0);
        d.record(p("/del.sol"), ChangeType::Remove, 1);

        assert_eq!(
            d.drain_due(100),
            vec![
                (p("/del.sol"), ChangeType::Remove),
                (p("/new.sol"), ChangeType::Add),
                (p("/swap.sol"), ChangeType::Change),
            ]
        );
    }

    #[test]
    fn cancel_drops_pending_change() {
        let mut d = Debouncer::new(Duration::from_millis(10));
        d.record(p("/a.sol"), ChangeType::Change, 0);
        d.cancel(Path::new("/a.sol"));
        assert_eq!(d.next_deadline(), None);
        assert!(d.drain_due(100).is_empty());
    }
}
