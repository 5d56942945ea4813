//! weft-core
//!
//! In-process orchestration core: assigns tasks to a dynamic pool of agents,
//! tracks agent liveness, and provides a small message bus (queues, pub/sub,
//! TTL key/value) for coordination.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, agent, events）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, EventSink, AssignmentStrategy）
//! - **impls**: ports の実装（割り当て戦略、Bus 向け EventSink）
//! - **store**: Task Store（優先度キュー、リトライ、dead letter）
//! - **registry**: Agent Registry（ハートビート監視）
//! - **bus**: Message Bus
//! - **app**: Coordinator、メンテナンスループ、CoreBuilder
//! - **bounded / timer**: 共有インフラ（容量上限付きコンテナ、キー付きタイマー）

pub mod app;
pub mod bounded;
pub mod bus;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod registry;
pub mod store;
pub mod timer;

pub use crate::app::{Coordinator, Core, CoreBuilder, CoreStatus};
pub use crate::bus::{BusMetrics, MessageBus, SubscriptionId};
pub use crate::config::CoreConfig;
pub use crate::domain::{
    Agent, AgentDescriptor, AgentId, DomainEvent, NewTask, Priority, Task, TaskId, TaskStatus,
};
pub use crate::error::{ConfigError, CoreError, Result};
pub use crate::registry::AgentRegistry;
pub use crate::store::{TaskStats, TaskStore};
