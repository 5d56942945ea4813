//! Store statistics and sweep reports.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::{Priority, TaskStatus};

/// Task counts per status plus queue depths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    /// Dead letters that have not expired yet.
    pub dead_letters: usize,
    pub queue_depths: BTreeMap<Priority, usize>,
}

impl TaskStats {
    pub(crate) fn count(&mut self, status: TaskStatus) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
        self.total += 1;
    }
}

/// Outcome of one `TaskStore::run_maintenance` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub purged_tasks: usize,
    pub expired_dead_letters: usize,
    pub trimmed_dead_letters: usize,
    pub pruned_orphans: usize,
    /// Malformed entries that were logged and left alone.
    pub skipped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_tracks_total() {
        let mut stats = TaskStats::default();
        stats.count(TaskStatus::Pending);
        stats.count(TaskStatus::Pending);
        stats.count(TaskStatus::Failed);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 3);
    }
}
