//! CoreBuilder - コンポーネントの構築とワイヤリング
//!
//! グローバルなシングルトンは持たず、ここが唯一の組み立て場所です。
//!
//! # 起動時検証
//! `build()` は設定を検証し、戦略名が不正なら構築前に失敗します。
//!
//! # イベントの流れ
//! 各コンポーネント -> FanoutEventSink
//!   - 呼び出し元が渡した sink（任意）
//!   - BusEventSink（topic 名のチャネルへ publish）
//!   - CoordinatorWakeSink（新しい仕事 / エージェントで割り当てパスを起こす）

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::info;

use super::coordinator::{Coordinator, CoordinatorWakeSink};
use super::maintenance::{Maintenance, MaintenanceLoop};
use super::status::{AgentCounts, CoreStatus};
use crate::bus::MessageBus;
use crate::config::CoreConfig;
use crate::error::ConfigError;
use crate::impls::BusEventSink;
use crate::impls::strategy::strategy_from_name;
use crate::ports::{
    AssignmentStrategy, Clock, EventSink, FanoutEventSink, IdGenerator, SystemClock,
    UlidGenerator,
};
use crate::registry::AgentRegistry;
use crate::store::TaskStore;

/// Builds a [`Core`].
///
/// ```ignore
/// let core = CoreBuilder::new(CoreConfig::from_path("weft.toml")?)
///     .event_sink(Arc::new(my_sink))
///     .build()?;
/// core.start();
/// ```
pub struct CoreBuilder {
    config: CoreConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    event_sink: Option<Arc<dyn EventSink>>,
    strategy: Option<Arc<dyn AssignmentStrategy>>,
    publish_events: bool,
}

impl CoreBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            clock: None,
            ids: None,
            event_sink: None,
            strategy: None,
            publish_events: true,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Extra sink receiving every lifecycle event.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Overrides `coordinator.assignment_strategy` from the config.
    pub fn strategy(mut self, strategy: Arc<dyn AssignmentStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Whether lifecycle events are republished on bus channels named by
    /// topic. On by default.
    pub fn publish_events_on_bus(mut self, enabled: bool) -> Self {
        self.publish_events = enabled;
        self
    }

    pub fn build(self) -> Result<Core, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => strategy_from_name(&config.coordinator.assignment_strategy).map_err(|err| {
                ConfigError::Invalid {
                    key: "coordinator.assignment_strategy",
                    message: err.to_string(),
                }
            })?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        let bus = MessageBus::new(config.bus.clone(), Arc::clone(&clock));
        let wake = Arc::new(Notify::new());

        let mut fanout = FanoutEventSink::new();
        if let Some(sink) = self.event_sink {
            fanout = fanout.with(sink);
        }
        if self.publish_events {
            fanout = fanout.with(Arc::new(BusEventSink::new(bus.clone())));
        }
        fanout = fanout.with(Arc::new(CoordinatorWakeSink::new(Arc::clone(&wake))));
        let events: Arc<dyn EventSink> = Arc::new(fanout);

        let store = TaskStore::new(
            config.tasks.clone(),
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&events),
        );
        let registry = AgentRegistry::new(
            config.agents.clone(),
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&events),
        );
        let coordinator = Coordinator::with_wake(
            store.clone(),
            registry.clone(),
            strategy,
            config.coordinator.poll_interval,
            wake,
        );

        Ok(Core {
            config,
            store,
            registry,
            bus,
            coordinator,
            loops: Mutex::new(Vec::new()),
        })
    }
}

/// The wired components. Every accessor hands out a cheap shared handle.
pub struct Core {
    config: CoreConfig,
    store: TaskStore,
    registry: AgentRegistry,
    bus: MessageBus,
    coordinator: Coordinator,
    loops: Mutex<Vec<MaintenanceLoop>>,
}

impl Core {
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Start the coordinator loop and both maintenance loops. Calling it
    /// again while running does nothing.
    pub fn start(&self) {
        self.coordinator.start();
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return;
        }
        let store: Arc<dyn Maintenance> = Arc::new(self.store.clone());
        let bus: Arc<dyn Maintenance> = Arc::new(self.bus.clone());
        loops.push(MaintenanceLoop::spawn(store, self.config.tasks.cleanup_interval));
        loops.push(MaintenanceLoop::spawn(bus, self.config.bus.cleanup_interval));
        info!("core started");
    }

    /// Stop every loop, disarm every timer and reset the bus. Safe to call
    /// more than once, or without `start`.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        let loops: Vec<MaintenanceLoop> = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            handle.shutdown_and_join().await;
        }
        self.store.shutdown().await;
        self.registry.shutdown().await;
        self.bus.shutdown();
        info!("core stopped");
    }

    pub async fn status(&self) -> CoreStatus {
        let mut agents = AgentCounts::default();
        for agent in self.registry.list().await {
            if agent.is_online() {
                agents.online += 1;
            } else {
                agents.offline += 1;
            }
        }
        CoreStatus {
            running: self.coordinator.is_running(),
            assignment_strategy: self.coordinator.assignment_strategy().name(),
            tasks: self.store.stats().await,
            agents,
            bus: self.bus.metrics(),
        }
    }
}
