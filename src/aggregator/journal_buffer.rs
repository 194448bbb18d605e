use std::sync::{Mutex, MutexGuard, PoisonError};

/// Matched kernel lines waiting for the next report
///
/// Append-only between flushes; `take_all` snapshots and clears under the
/// same lock, so a concurrent append lands either in the snapshot or in the
/// next cycle, never in neither. Lines are not deduplicated.
#[derive(Debug, Default)]
pub struct JournalBuffer {
    lines: Mutex<Vec<String>>,
}

impl JournalBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one line
    pub fn push(&self, line: impl Into<String>) {
        self.lock().push(line.into());
    }

    /// Remove and return every buffered line in arrival order
    pub fn take_all(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
