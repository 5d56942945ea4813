//! Dead-letter list: tasks that exhausted their retry budget.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{TaskId, TaskType};
use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn check(&self) -> Result<(), CoreError> {
        if self.expires_at < self.failed_at {
            return Err(CoreError::Internal(format!(
                "dead letter {} expires before it failed",
                self.task_id
            )));
        }
        Ok(())
    }
}

/// Append-only list, oldest first. Size is enforced by [`DeadLetterList::sweep`]
/// during maintenance, after expired entries are gone.
#[derive(Debug, Clone)]
pub struct DeadLetterList {
    entries: VecDeque<DeadLetterEntry>,
    max_entries: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterSweep {
    pub expired: usize,
    pub trimmed: usize,
    pub skipped: usize,
}

impl DeadLetterList {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
        }
    }

    pub fn push(&mut self, entry: DeadLetterEntry) {
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that have not expired at `now`.
    pub fn live(&self, now: DateTime<Utc>) -> Vec<DeadLetterEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .collect()
    }

    /// TTL first, then the size cap. An inconsistent entry is logged and left
    /// for the size cap to deal with; it never aborts the sweep.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> DeadLetterSweep {
        let mut report = DeadLetterSweep::default();
        let before = self.entries.len();
        self.entries.retain(|entry| match entry.check() {
            Ok(()) => !entry.is_expired(now),
            Err(err) => {
                tracing::warn!(task_id = %entry.task_id, error = %err, "skipping dead letter during sweep");
                report.skipped += 1;
                true
            }
        });
        report.expired = before - self.entries.len();

        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
            report.trimmed += 1;
        }
        report
    }
}
