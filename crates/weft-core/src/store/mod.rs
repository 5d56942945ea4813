//! Task Store - タスクレコードと優先度別の pending キューを管理
//!
//! エージェントについては何も知りません（AgentId を記録するだけ）。
//!
//! # ロックとイベント
//! - 状態はすべて 1 つの `tokio::sync::Mutex` の内側にある
//! - read-then-write の操作（assign / retry-requeue / timeout）はロック内で完結
//! - イベントはロック解放後に `EventSink` へ流す
//!
//! # タイムアウト
//! `assign` のたびに `TimerService` でタイムアウトを張り直します。発火時は
//! 「まだ存在するか・同じ attempt のままか」を確認してから `fail` と同じ経路を通ります。

mod dead_letter;
mod pending;
mod record;
mod retry;
mod stats;

pub use dead_letter::{DeadLetterEntry, DeadLetterList};
pub use pending::PendingQueues;
pub use record::TaskRecord;
pub use retry::RetryDecision;
pub use stats::{SweepReport, TaskStats};

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::app::maintenance::Maintenance;
use crate::bounded::BoundedMap;
use crate::config::TaskStoreConfig;
use crate::domain::{AgentId, DomainEvent, NewTask, Priority, Task, TaskId, TaskStatus, TaskType};
use crate::error::{CoreError, Result};
use crate::ports::{Clock, EventSink, IdGenerator};
use crate::timer::TimerService;

const ENTITY: &str = "task";

struct StoreState {
    tasks: BoundedMap<TaskId, TaskRecord>,
    pending: PendingQueues,
    dead_letters: DeadLetterList,
}

impl StoreState {
    fn record(&self, task_id: TaskId) -> Result<&TaskRecord> {
        self.tasks
            .get(&task_id)
            .ok_or_else(|| CoreError::not_found(ENTITY, task_id))
    }

    fn record_mut(&mut self, task_id: TaskId) -> Result<&mut TaskRecord> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::not_found(ENTITY, task_id))
    }

    /// Count a failed attempt and either requeue or dead-letter the task.
    /// Caller has checked the task is in progress.
    fn apply_failure(
        &mut self,
        task_id: TaskId,
        error: String,
        now: DateTime<Utc>,
        dead_letter_ttl: chrono::Duration,
    ) -> Result<(Task, DomainEvent)> {
        let record = self.record_mut(task_id)?;
        record.record_failure(error.clone(), now);
        let retry_count = record.task().retry_count;

        match retry::decide(retry_count, record.task().max_retries) {
            RetryDecision::Requeue => {
                record.requeue(now);
                let priority = record.task().priority;
                let snapshot = record.snapshot();
                if let Some(dropped) = self.pending.push_back(priority, task_id) {
                    warn!(task_id = %dropped, %priority, "pending tier full; dropped oldest id");
                }
                info!(%task_id, retry_count, %error, "task failed; requeued for retry");
                Ok((
                    snapshot,
                    DomainEvent::TaskRetrying {
                        task_id,
                        retry_count,
                        error,
                    },
                ))
            }
            RetryDecision::DeadLetter => {
                record.mark_failed(now);
                let snapshot = record.snapshot();
                let expires_at = now
                    .checked_add_signed(dead_letter_ttl)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.dead_letters.push(DeadLetterEntry {
                    task_id,
                    task_type: snapshot.task_type.clone(),
                    error: error.clone(),
                    retry_count,
                    failed_at: now,
                    expires_at,
                });
                info!(%task_id, retry_count, %error, "task failed permanently; moved to dead letters");
                Ok((
                    snapshot,
                    DomainEvent::TaskFailed {
                        task_id,
                        retry_count,
                        error,
                        expires_at,
                    },
                ))
            }
        }
    }
}

struct Shared {
    state: Mutex<StoreState>,
    timers: TimerService<TaskId>,
    config: TaskStoreConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

/// In-memory task store. Cloning shares the same store.
#[derive(Clone)]
pub struct TaskStore {
    shared: Arc<Shared>,
}

impl TaskStore {
    pub fn new(
        config: TaskStoreConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let state = StoreState {
            tasks: BoundedMap::new(config.max_tasks),
            pending: PendingQueues::new(config.max_tasks),
            dead_letters: DeadLetterList::new(config.max_dead_letters),
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                timers: TimerService::new(),
                config,
                clock,
                ids,
                events,
            }),
        }
    }

    pub fn config(&self) -> &TaskStoreConfig {
        &self.shared.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    fn dead_letter_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.shared.config.dead_letter_ttl)
            .unwrap_or(chrono::Duration::MAX)
    }

    fn emit_all(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.shared.events.emit(event);
        }
    }

    /// Create a pending task at the tail of its priority tier.
    pub async fn create_task(
        &self,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
        priority: Option<Priority>,
    ) -> Task {
        let spec = NewTask::new(task_type, payload).priority(priority.unwrap_or_default());
        self.submit(spec).await
    }

    /// Create a pending task from a full request.
    ///
    /// When the store is at capacity the oldest task is evicted, whatever its
    /// state.
    pub async fn submit(&self, spec: NewTask) -> Task {
        let task_id = self.shared.ids.task_id();
        let now = self.now();
        let record = TaskRecord::new(task_id, spec, self.shared.config.max_retries, now);
        let snapshot = record.snapshot();

        let mut events = Vec::new();
        {
            let mut state = self.shared.state.lock().await;
            for (evicted_id, evicted) in state.tasks.insert(task_id, record) {
                self.shared.timers.disarm(&evicted_id);
                state.pending.remove(evicted.task().priority, &evicted_id);
                warn!(task_id = %evicted_id, status = %evicted.status(), "task store full; evicted oldest task");
                events.push(DomainEvent::TaskEvicted {
                    task_id: evicted_id,
                });
            }
            if let Some(dropped) = state.pending.push_back(snapshot.priority, task_id) {
                warn!(task_id = %dropped, priority = %snapshot.priority, "pending tier full; dropped oldest id");
            }
        }

        info!(%task_id, task_type = %snapshot.task_type, priority = %snapshot.priority, "task created");
        events.push(DomainEvent::TaskCreated {
            task_id,
            task_type: snapshot.task_type.clone(),
            priority: snapshot.priority,
        });
        self.emit_all(events);
        snapshot
    }

    /// Pop the next pending task: highest tier first, FIFO within a tier.
    /// Ids whose task is gone or no longer pending are discarded on the way.
    pub async fn next_pending_task(&self) -> Option<Task> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let tasks = &state.tasks;
        let task_id = state.pending.pop_next(|task_id| {
            tasks
                .get(task_id)
                .is_some_and(|record| record.status() == TaskStatus::Pending)
        })?;
        state.tasks.get(&task_id).map(TaskRecord::snapshot)
    }

    /// Put a popped-but-unassigned pending task back at the head of its tier.
    pub async fn requeue(&self, task_id: TaskId) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let record = state.record(task_id)?;
        if record.status() != TaskStatus::Pending {
            return Err(CoreError::invalid_state(
                ENTITY,
                task_id,
                record.status(),
                "requeue",
            ));
        }
        let priority = record.task().priority;
        if !state.pending.contains(priority, &task_id) {
            if let Some(dropped) = state.pending.push_front(priority, task_id) {
                warn!(task_id = %dropped, %priority, "pending tier full; dropped newest id");
            }
            debug!(%task_id, "task returned to head of its tier");
        }
        Ok(())
    }

    /// Pending -> InProgress, arming the task timeout.
    pub async fn assign(&self, task_id: TaskId, agent_id: AgentId) -> Result<Task> {
        let now = self.now();
        let (snapshot, attempt) = {
            let mut state = self.shared.state.lock().await;
            let record = state.record_mut(task_id)?;
            if record.status() != TaskStatus::Pending {
                return Err(CoreError::invalid_state(
                    ENTITY,
                    task_id,
                    record.status(),
                    "assign",
                ));
            }
            record.start(agent_id, now);
            let snapshot = record.snapshot();
            let attempt = record.attempt();
            // 直接 assign された場合でもキューに id を残さない
            state.pending.remove(snapshot.priority, &task_id);
            self.arm_timeout(task_id, attempt);
            (snapshot, attempt)
        };

        info!(%task_id, %agent_id, attempt, "task assigned");
        self.shared
            .events
            .emit(DomainEvent::TaskAssigned { task_id, agent_id });
        Ok(snapshot)
    }

    fn arm_timeout(&self, task_id: TaskId, attempt: u32) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        self.shared
            .timers
            .arm(task_id, self.shared.config.task_timeout, move || async move {
                if let Some(shared) = weak.upgrade() {
                    TaskStore { shared }.handle_timeout(task_id, attempt).await;
                }
            });
    }

    async fn handle_timeout(&self, task_id: TaskId, attempt: u32) {
        let now = self.now();
        let outcome = {
            let mut state = self.shared.state.lock().await;
            let current = state
                .tasks
                .get(&task_id)
                .map(|record| (record.status(), record.attempt(), record.task().assigned_agent));
            match current {
                Some((TaskStatus::InProgress, current_attempt, agent_id))
                    if current_attempt == attempt =>
                {
                    let error = CoreError::Timeout {
                        id: task_id.to_string(),
                    }
                    .to_string();
                    state
                        .apply_failure(task_id, error, now, self.dead_letter_ttl())
                        .map(|(_, event)| (agent_id, event))
                }
                _ => {
                    debug!(%task_id, attempt, "stale task timeout ignored");
                    return;
                }
            }
        };

        match outcome {
            Ok((agent_id, event)) => {
                warn!(%task_id, ?agent_id, "task timed out");
                self.emit_all(vec![DomainEvent::TaskTimedOut { task_id, agent_id }, event]);
            }
            Err(err) => warn!(%task_id, error = %err, "task timeout could not be applied"),
        }
    }

    /// InProgress -> Completed.
    pub async fn complete(&self, task_id: TaskId, result: serde_json::Value) -> Result<Task> {
        let now = self.now();
        let snapshot = {
            let mut state = self.shared.state.lock().await;
            let record = state.record_mut(task_id)?;
            if record.status() != TaskStatus::InProgress {
                return Err(CoreError::invalid_state(
                    ENTITY,
                    task_id,
                    record.status(),
                    "complete",
                ));
            }
            record.complete(result, now);
            self.shared.timers.disarm(&task_id);
            record.snapshot()
        };

        info!(%task_id, agent_id = ?snapshot.assigned_agent, "task completed");
        self.shared.events.emit(DomainEvent::TaskCompleted {
            task_id,
            agent_id: snapshot.assigned_agent,
        });
        Ok(snapshot)
    }

    /// Report a failed attempt. Requeues while retry budget remains, otherwise
    /// marks the task failed and dead-letters it.
    pub async fn fail(&self, task_id: TaskId, error: impl Into<String>) -> Result<Task> {
        let now = self.now();
        let (snapshot, event) = {
            let mut state = self.shared.state.lock().await;
            let status = state.record(task_id)?.status();
            if status != TaskStatus::InProgress {
                return Err(CoreError::invalid_state(ENTITY, task_id, status, "fail"));
            }
            self.shared.timers.disarm(&task_id);
            state.apply_failure(task_id, error.into(), now, self.dead_letter_ttl())?
        };

        self.shared.events.emit(event);
        Ok(snapshot)
    }

    /// Pending | InProgress -> Cancelled.
    pub async fn cancel(&self, task_id: TaskId) -> Result<Task> {
        let now = self.now();
        let snapshot = {
            let mut state = self.shared.state.lock().await;
            let record = state.record_mut(task_id)?;
            if record.status().is_terminal() {
                return Err(CoreError::invalid_state(
                    ENTITY,
                    task_id,
                    record.status(),
                    "cancel",
                ));
            }
            record.cancel(now);
            let snapshot = record.snapshot();
            state.pending.remove(snapshot.priority, &task_id);
            self.shared.timers.disarm(&task_id);
            snapshot
        };

        info!(%task_id, "task cancelled");
        self.shared
            .events
            .emit(DomainEvent::TaskCancelled { task_id });
        Ok(snapshot)
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Task> {
        let state = self.shared.state.lock().await;
        state.record(task_id).map(TaskRecord::snapshot)
    }

    /// Tasks in `status`, oldest first.
    pub async fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let state = self.shared.state.lock().await;
        state
            .tasks
            .values()
            .filter(|record| record.status() == status)
            .map(TaskRecord::snapshot)
            .collect()
    }

    /// Dead letters that have not expired yet, oldest first.
    pub async fn list_dead_letters(&self) -> Vec<DeadLetterEntry> {
        let now = self.now();
        let state = self.shared.state.lock().await;
        state.dead_letters.live(now)
    }

    pub async fn stats(&self) -> TaskStats {
        let now = self.now();
        let state = self.shared.state.lock().await;
        let mut stats = TaskStats::default();
        for record in state.tasks.values() {
            stats.count(record.status());
        }
        stats.dead_letters = state.dead_letters.live(now).len();
        stats.queue_depths = state.pending.depths();
        stats
    }

    /// One maintenance pass:
    /// 1. purge terminal tasks older than the retention window
    /// 2. expire dead letters, then trim them to the size cap
    /// 3. prune pending ids that no longer point at a pending task
    pub async fn run_maintenance(&self) -> SweepReport {
        let now = self.now();
        let retention = chrono::Duration::from_std(self.shared.config.task_retention)
            .unwrap_or(chrono::Duration::MAX);
        let mut report = SweepReport::default();

        let mut state = self.shared.state.lock().await;

        let purged = state.tasks.retain(|task_id, record| {
            if !record.status().is_terminal() {
                return true;
            }
            let finished_at = match record.finished_at() {
                Some(at) => at,
                None => {
                    warn!(%task_id, status = %record.status(), "terminal task without finish time; using last update");
                    report.skipped += 1;
                    record.task().updated_at
                }
            };
            now.signed_duration_since(finished_at) <= retention
        });
        report.purged_tasks = purged.len();

        let dead = state.dead_letters.sweep(now);
        report.expired_dead_letters = dead.expired;
        report.trimmed_dead_letters = dead.trimmed;
        report.skipped += dead.skipped;

        let StoreState { tasks, pending, .. } = &mut *state;
        report.pruned_orphans = pending.prune(|task_id| {
            tasks
                .get(task_id)
                .is_some_and(|record| record.status() == TaskStatus::Pending)
        });
        drop(state);

        if report.is_empty() {
            debug!("task store sweep: nothing to do");
        } else {
            info!(?report, "task store sweep");
        }
        report
    }

    /// Disarm every task timer. Records stay in place.
    pub async fn shutdown(&self) {
        let disarmed = self.shared.timers.clear();
        debug!(disarmed, "task store timers disarmed");
    }
}

#[async_trait]
impl Maintenance for TaskStore {
    fn name(&self) -> &'static str {
        "task_store"
    }

    async fn sweep(&self) {
        self.run_maintenance().await;
    }
}
