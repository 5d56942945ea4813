//! AssignmentStrategy port - 候補エージェントから 1 体を選ぶ
//!
//! Coordinator は「いま割り当て可能なエージェント」の一覧を渡し、
//! どれを選ぶかは strategy に委ねます。strategy が持つ状態
//! （round-robin のカーソルなど）は strategy 自身が管理します。
//!
//! # 実装
//! - `impls::strategy::RoundRobin`（デフォルト）
//! - `impls::strategy::LeastRecentlyAssigned`
//! - `impls::strategy::CapabilityWeighted`

use crate::domain::{Agent, AgentId, Task};

pub trait AssignmentStrategy: Send + Sync {
    /// Stable name, also accepted by `strategy_from_name`.
    fn name(&self) -> &'static str;

    /// Pick one of `candidates` for `task`. `candidates` are online, eligible
    /// for the task, and listed in registration order. Returning `None` leaves
    /// the task pending.
    fn select(&self, task: &Task, candidates: &[Agent]) -> Option<AgentId>;
}
