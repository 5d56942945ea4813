//! Status - コア全体のスナップショット

use serde::Serialize;

use crate::bus::BusMetrics;
use crate::store::TaskStats;

/// Point-in-time view of every component, for dashboards and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub running: bool,
    pub assignment_strategy: &'static str,
    pub tasks: TaskStats,
    pub agents: AgentCounts,
    pub bus: BusMetrics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentCounts {
    pub online: usize,
    pub offline: usize,
}
