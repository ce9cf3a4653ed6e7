use crate::FileChangeEvent;
use std::time::Duration;

/// Collects change events across files into one batch per window.
///
/// The window opens with the first event and closes `window` later; events
/// for a path already in the batch replace the earlier one in place.
#[derive(Debug, Clone)]
pub struct ChangeAggregator {
    window_ms: u64,
    pending: Vec<FileChangeEvent>,
    deadline: Option<u64>,
}

impl ChangeAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            pending: Vec::new(),
            deadline: None,
        }
    }

    pub fn push(&mut self, event: FileChangeEvent, now: u64) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window_ms);
        }
        match self
            .pending
            .iter_mut()
            .find(|pending| pending.file_path == event.file_path)
        {
            Some(existing) => *existing = event,
            None => self.pending.push(event),
        }
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// The batch, if its window has closed.
    pub fn take_due(&mut self, now: u64) -> Option<Vec<FileChangeEvent>> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.flush(),
            _ => None,
        }
    }

    /// The batch regardless of the window.
    pub fn flush(&mut self) -> Option<Vec<FileChangeEvent>> {
        self.deadline = None;
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
