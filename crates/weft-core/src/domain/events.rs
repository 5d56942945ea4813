//! Events - ドメインイベント
//!
//! 各コンポーネントは状態遷移のたびにイベントを `EventSink` へ流します。
//! 送信はロック解放後に行い、呼び出し元をブロックしません。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, Priority, TaskId, TaskType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskCreated {
        task_id: TaskId,
        task_type: TaskType,
        priority: Priority,
    },
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: Option<AgentId>,
    },
    /// Failed attempt with retry budget left; the task is pending again.
    TaskRetrying {
        task_id: TaskId,
        retry_count: u32,
        error: String,
    },
    /// Retry budget exhausted; the task is in the dead-letter list.
    TaskFailed {
        task_id: TaskId,
        retry_count: u32,
        error: String,
        expires_at: DateTime<Utc>,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    TaskTimedOut {
        task_id: TaskId,
        agent_id: Option<AgentId>,
    },
    /// Dropped to keep the task collection within its capacity.
    TaskEvicted {
        task_id: TaskId,
    },
    AgentRegistered {
        agent_id: AgentId,
        name: Option<String>,
    },
    AgentOffline {
        agent_id: AgentId,
    },
    AgentReconnected {
        agent_id: AgentId,
    },
    AgentUnregistered {
        agent_id: AgentId,
    },
}

impl DomainEvent {
    /// Channel-style topic name, e.g. `task:completed`.
    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::TaskCreated { .. } => "task:created",
            DomainEvent::TaskAssigned { .. } => "task:assigned",
            DomainEvent::TaskCompleted { .. } => "task:completed",
            DomainEvent::TaskRetrying { .. } => "task:retrying",
            DomainEvent::TaskFailed { .. } => "task:failed",
            DomainEvent::TaskCancelled { .. } => "task:cancelled",
            DomainEvent::TaskTimedOut { .. } => "task:timeout",
            DomainEvent::TaskEvicted { .. } => "task:evicted",
            DomainEvent::AgentRegistered { .. } => "agent:registered",
            DomainEvent::AgentOffline { .. } => "agent:offline",
            DomainEvent::AgentReconnected { .. } => "agent:reconnected",
            DomainEvent::AgentUnregistered { .. } => "agent:unregistered",
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            DomainEvent::TaskCreated { task_id, .. }
            | DomainEvent::TaskAssigned { task_id, .. }
            | DomainEvent::TaskCompleted { task_id, .. }
            | DomainEvent::TaskRetrying { task_id, .. }
            | DomainEvent::TaskFailed { task_id, .. }
            | DomainEvent::TaskCancelled { task_id }
            | DomainEvent::TaskTimedOut { task_id, .. }
            | DomainEvent::TaskEvicted { task_id } => Some(*task_id),
            _ => None,
        }
    }
}
