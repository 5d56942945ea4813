//! Task record: the single source of truth for one task.

use chrono::{DateTime, Utc};

use crate::domain::{AgentId, NewTask, Task, TaskId, TaskStatus};

/// Metadata + snapshot for a task held by the store.
///
/// - Pending queues hold TaskId only.
/// - All state transitions happen here.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    task: Task,
    /// Incremented on every assignment so a stale timeout can tell it belongs
    /// to an earlier attempt.
    attempt: u32,
}

impl TaskRecord {
    pub fn new(id: TaskId, spec: NewTask, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            task: Task {
                id,
                task_type: spec.task_type,
                payload: spec.payload,
                priority: spec.priority,
                status: TaskStatus::Pending,
                required_capabilities: spec.required_capabilities,
                retry_count: 0,
                max_retries: spec.max_retries.unwrap_or(default_max_retries),
                assigned_agent: None,
                result: None,
                error: None,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            },
            attempt: 0,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn snapshot(&self) -> Task {
        self.task.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the task reached a terminal state, if it did.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.task.completed_at
    }

    /// Pending -> InProgress.
    pub fn start(&mut self, agent_id: AgentId, now: DateTime<Utc>) {
        self.attempt += 1;
        self.task.status = TaskStatus::InProgress;
        self.task.assigned_agent = Some(agent_id);
        self.task.started_at = Some(now);
        self.task.updated_at = now;
    }

    /// InProgress -> Completed.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.task.status = TaskStatus::Completed;
        self.task.result = Some(result);
        self.task.completed_at = Some(now);
        self.task.updated_at = now;
    }

    /// Count one failed attempt without exceeding the retry bound.
    pub fn record_failure(&mut self, error: String, now: DateTime<Utc>) {
        if self.task.retry_count < self.task.max_retries {
            self.task.retry_count += 1;
        }
        self.task.error = Some(error);
        self.task.updated_at = now;
    }

    /// InProgress -> Pending (retry).
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.task.status = TaskStatus::Pending;
        self.task.assigned_agent = None;
        self.task.started_at = None;
        self.task.updated_at = now;
    }

    /// InProgress -> Failed (retry budget exhausted).
    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.task.status = TaskStatus::Failed;
        self.task.completed_at = Some(now);
        self.task.updated_at = now;
    }

    /// Pending | InProgress -> Cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.task.status = TaskStatus::Cancelled;
        self.task.completed_at = Some(now);
        self.task.updated_at = now;
    }
}
