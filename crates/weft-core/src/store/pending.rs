//! Per-priority pending queues (TaskIds only).

use std::collections::BTreeMap;

use crate::bounded::BoundedDeque;
use crate::domain::{Priority, TaskId};

/// One FIFO per priority tier.
///
/// Queues may hold stale ids (cancelled, evicted, already assigned); readers
/// check the record before trusting an id, and maintenance prunes them.
#[derive(Debug, Clone)]
pub struct PendingQueues {
    tiers: [BoundedDeque<TaskId>; 4],
}

fn tier_index(priority: Priority) -> usize {
    match priority {
        Priority::Low => 0,
        Priority::Normal => 1,
        Priority::High => 2,
        Priority::Critical => 3,
    }
}

impl PendingQueues {
    pub fn new(capacity_per_tier: usize) -> Self {
        Self {
            tiers: std::array::from_fn(|_| BoundedDeque::new(capacity_per_tier)),
        }
    }

    fn tier(&self, priority: Priority) -> &BoundedDeque<TaskId> {
        &self.tiers[tier_index(priority)]
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut BoundedDeque<TaskId> {
        &mut self.tiers[tier_index(priority)]
    }

    /// Append to the tail of the tier. Returns an id dropped for capacity.
    pub fn push_back(&mut self, priority: Priority, task_id: TaskId) -> Option<TaskId> {
        self.tier_mut(priority).push_back(task_id)
    }

    /// Return an id to the head of its tier.
    pub fn push_front(&mut self, priority: Priority, task_id: TaskId) -> Option<TaskId> {
        self.tier_mut(priority).push_front(task_id)
    }

    pub fn contains(&self, priority: Priority, task_id: &TaskId) -> bool {
        self.tier(priority).contains(task_id)
    }

    pub fn remove(&mut self, priority: Priority, task_id: &TaskId) -> usize {
        self.tier_mut(priority).remove_all(task_id)
    }

    /// Pop ids from the highest non-empty tier downwards until `is_live`
    /// accepts one. Rejected ids are discarded.
    pub fn pop_next<F>(&mut self, mut is_live: F) -> Option<TaskId>
    where
        F: FnMut(&TaskId) -> bool,
    {
        for priority in Priority::DESCENDING {
            let tier = self.tier_mut(priority);
            while let Some(task_id) = tier.pop_front() {
                if is_live(&task_id) {
                    return Some(task_id);
                }
            }
        }
        None
    }

    /// Drop ids rejected by `keep` from every tier. Returns how many went.
    pub fn prune<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&TaskId) -> bool,
    {
        self.tiers
            .iter_mut()
            .map(|tier| tier.retain(|task_id| keep(task_id)))
            .sum()
    }

    pub fn depths(&self) -> BTreeMap<Priority, usize> {
        Priority::DESCENDING
            .into_iter()
            .map(|priority| (priority, self.tier(priority).len()))
            .collect()
    }

    pub fn clear(&mut self) {
        for tier in &mut self.tiers {
            tier.clear();
        }
    }
}
