//! Coordinator - pending タスクを空いているエージェントへ割り当てる
//!
//! 自身が持つ状態は割り当て戦略（と戦略内部のカーソル）だけで、タスクとエージェントの
//! 真実は Task Store / Agent Registry にあります。
//!
//! # 1 回の割り当てパス（`tick`）
//! 1. `next_pending_task` で最優先のタスクを取り出す（なければ終了）
//! 2. タスクの required capabilities で `list_available` を絞る
//! 3. 候補が無ければタスクを tier の先頭へ戻してパス終了
//!    （下位 tier のタスクが先に出ていくのを防ぐ）
//! 4. 戦略で 1 つ選んで `assign`。失敗してもループは落とさず、タスクを戻して終了
//!
//! # ループ
//! `poll_interval` ごと、または `trigger()`（タスク作成やエージェント登録のイベント）で
//! パスを実行します。停止は worker と同じく `watch` チャネル。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::domain::{AgentId, DomainEvent, Task, TaskId};
use crate::error::Result;
use crate::impls::strategy::strategy_from_name;
use crate::ports::{AssignmentStrategy, EventSink};
use crate::registry::AgentRegistry;
use crate::store::TaskStore;

/// One binding made by an assignment pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub agent_id: AgentId,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct Inner {
    store: TaskStore,
    registry: AgentRegistry,
    strategy: RwLock<Arc<dyn AssignmentStrategy>>,
    poll_interval: Duration,
    wake: Arc<Notify>,
    running: Mutex<Option<Running>>,
}

/// Cloning shares the same coordinator.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        store: TaskStore,
        registry: AgentRegistry,
        strategy: Arc<dyn AssignmentStrategy>,
        poll_interval: Duration,
    ) -> Self {
        Self::with_wake(store, registry, strategy, poll_interval, Arc::new(Notify::new()))
    }

    /// Build with a shared wake-up handle, so a [`CoordinatorWakeSink`]
    /// created before the coordinator can trigger it.
    pub fn with_wake(
        store: TaskStore,
        registry: AgentRegistry,
        strategy: Arc<dyn AssignmentStrategy>,
        poll_interval: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                strategy: RwLock::new(strategy),
                poll_interval,
                wake,
                running: Mutex::new(None),
            }),
        }
    }

    pub fn assignment_strategy(&self) -> Arc<dyn AssignmentStrategy> {
        Arc::clone(&self.inner.strategy.read())
    }

    pub fn set_assignment_strategy(&self, strategy: Arc<dyn AssignmentStrategy>) {
        info!(strategy = strategy.name(), "assignment strategy changed");
        *self.inner.strategy.write() = strategy;
    }

    pub fn set_assignment_strategy_by_name(&self, name: &str) -> Result<()> {
        let strategy = strategy_from_name(name)?;
        self.set_assignment_strategy(strategy);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Wake the loop for an immediate pass.
    pub fn trigger(&self) {
        self.inner.wake.notify_one();
    }

    /// Run one assignment pass. Returns the assignments made, in order.
    pub async fn tick(&self) -> Vec<Assignment> {
        let store = &self.inner.store;
        let registry = &self.inner.registry;
        let mut made = Vec::new();

        while let Some(task) = store.next_pending_task().await {
            let required: Vec<String> = task.required_capabilities.iter().cloned().collect();
            let candidates = registry.list_available(&required).await;
            let strategy = self.assignment_strategy();

            let Some(agent_id) = strategy.select(&task, &candidates) else {
                debug!(task_id = %task.id, ?required, "no eligible agent; task left pending");
                self.put_back(&task).await;
                break;
            };

            match store.assign(task.id, agent_id).await {
                Ok(_) => {
                    if let Err(err) = registry.record_assignment(agent_id).await {
                        // 割り当て直後に登録解除された
                        warn!(task_id = %task.id, %agent_id, error = %err, "assigned agent vanished");
                    }
                    made.push(Assignment {
                        task_id: task.id,
                        agent_id,
                    });
                }
                Err(err) => {
                    error!(task_id = %task.id, %agent_id, error = %err, "assignment failed; retrying next tick");
                    self.put_back(&task).await;
                    break;
                }
            }
        }

        if !made.is_empty() {
            debug!(count = made.len(), "assignment pass");
        }
        made
    }

    async fn put_back(&self, task: &Task) {
        if let Err(err) = self.inner.store.requeue(task.id).await {
            // 取り出した後に cancel や追い出しが入った
            debug!(task_id = %task.id, error = %err, "popped task not returned to queue");
        }
    }

    /// Start the loop. Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return false;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run(self.clone(), shutdown_rx));
        *running = Some(Running { shutdown_tx, join });
        info!(poll_interval = ?self.inner.poll_interval, strategy = self.assignment_strategy().name(), "coordinator started");
        true
    }

    /// Stop the loop and wait for it. Safe to call when never started.
    pub async fn shutdown(&self) {
        let Some(running) = self.inner.running.lock().take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        let _ = running.join.await;
        info!("coordinator stopped");
    }
}

async fn run(coordinator: Coordinator, mut shutdown_rx: watch::Receiver<bool>) {
    let wake = Arc::clone(&coordinator.inner.wake);
    let mut ticker = tokio::time::interval(coordinator.inner.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
        coordinator.tick().await;
    }
}

/// Event sink that wakes the coordinator when new work or a new agent shows
/// up, so assignment does not wait for the next poll.
pub struct CoordinatorWakeSink {
    wake: Arc<Notify>,
}

impl CoordinatorWakeSink {
    pub fn new(wake: Arc<Notify>) -> Self {
        Self { wake }
    }
}

impl EventSink for CoordinatorWakeSink {
    fn emit(&self, event: DomainEvent) {
        if matches!(
            event,
            DomainEvent::TaskCreated { .. }
                | DomainEvent::TaskRetrying { .. }
                | DomainEvent::AgentRegistered { .. }
                | DomainEvent::AgentReconnected { .. }
        ) {
            self.wake.notify_one();
        }
    }
}
