//! Impls - ports の具象実装
//!
//! - **strategy**: 割り当て戦略（round-robin / least-recently-assigned / capability-weighted）
//! - **bus_sink**: ドメインイベントを Message Bus へ流す EventSink

pub mod bus_sink;
pub mod strategy;

pub use self::bus_sink::BusEventSink;
pub use self::strategy::{
    CapabilityWeighted, LeastRecentlyAssigned, RoundRobin, STRATEGY_NAMES, strategy_from_name,
};
