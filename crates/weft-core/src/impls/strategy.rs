//! Assignment strategies.
//!
//! Candidates always arrive in registration order, so every strategy here is
//! deterministic for a given candidate list and history.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::domain::{Agent, AgentId, Task};
use crate::error::{CoreError, Result};
use crate::ports::AssignmentStrategy;

pub const ROUND_ROBIN: &str = "round_robin";
pub const LEAST_RECENTLY_ASSIGNED: &str = "least_recently_assigned";
pub const CAPABILITY_WEIGHTED: &str = "capability_weighted";

/// Names accepted by [`strategy_from_name`].
pub const STRATEGY_NAMES: [&str; 3] = [ROUND_ROBIN, LEAST_RECENTLY_ASSIGNED, CAPABILITY_WEIGHTED];

pub fn strategy_from_name(name: &str) -> Result<Arc<dyn AssignmentStrategy>> {
    match name {
        ROUND_ROBIN => Ok(Arc::new(RoundRobin::new())),
        LEAST_RECENTLY_ASSIGNED => Ok(Arc::new(LeastRecentlyAssigned)),
        CAPABILITY_WEIGHTED => Ok(Arc::new(CapabilityWeighted)),
        other => Err(CoreError::UnknownStrategy(other.to_string())),
    }
}

/// Cycles through the candidate list with a shared cursor.
#[derive(Debug, Default)]
pub struct RoundRobin {
    idx: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            idx: AtomicUsize::new(0),
        }
    }
}

impl AssignmentStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }

    fn select(&self, _task: &Task, candidates: &[Agent]) -> Option<AgentId> {
        if candidates.is_empty() {
            return None;
        }
        let i = self.idx.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[i].id)
    }
}

/// Picks the agent that has gone longest without an assignment. Agents that
/// were never assigned win; ties go to the earliest registration.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyAssigned;

impl AssignmentStrategy for LeastRecentlyAssigned {
    fn name(&self) -> &'static str {
        LEAST_RECENTLY_ASSIGNED
    }

    fn select(&self, _task: &Task, candidates: &[Agent]) -> Option<AgentId> {
        // Option の順序は None < Some なので未割り当てが先頭に来る
        candidates
            .iter()
            .min_by_key(|agent| agent.last_assigned_at)
            .map(|agent| agent.id)
    }
}

/// Prefers specialists: the agent whose capability set has the fewest tags
/// beyond what the task requires. Ties go to the agent with fewer assignments,
/// then to the earliest registration.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapabilityWeighted;

impl AssignmentStrategy for CapabilityWeighted {
    fn name(&self) -> &'static str {
        CAPABILITY_WEIGHTED
    }

    fn select(&self, task: &Task, candidates: &[Agent]) -> Option<AgentId> {
        candidates
            .iter()
            .min_by_key(|agent| {
                let extra = agent
                    .capabilities
                    .iter()
                    .filter(|capability| !task.required_capabilities.contains(*capability))
                    .count();
                (extra, agent.assignments)
            })
            .map(|agent| agent.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Liveness, Priority, TaskId, TaskStatus, TaskType};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::collections::BTreeSet;
    use ulid::Ulid;

    fn agent(caps: &[&str], last_assigned_secs: Option<i64>, assignments: u64) -> Agent {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Agent {
            id: AgentId::from_ulid(Ulid::new()),
            name: None,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            metadata: None,
            liveness: Liveness::Online,
            registered_at: at,
            last_heartbeat: at,
            last_assigned_at: last_assigned_secs.map(|s| at + chrono::Duration::seconds(s)),
            assignments,
        }
    }

    fn task(required: &[&str]) -> Task {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Task {
            id: TaskId::from_ulid(Ulid::new()),
            task_type: TaskType::new("t"),
            payload: serde_json::json!({}),
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            required_capabilities: required.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
            retry_count: 0,
            max_retries: 3,
            assigned_agent: None,
            result: None,
            error: None,
            created_at: at,
            updated_at: at,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn round_robin_cycles_and_wraps() {
        let rr = RoundRobin::new();
        let agents = vec![agent(&[], None, 0), agent(&[], None, 0), agent(&[], None, 0)];
        let t = task(&[]);

        let picks: Vec<AgentId> = (0..4).map(|_| rr.select(&t, &agents).unwrap()).collect();
        assert_eq!(
            picks,
            vec![agents[0].id, agents[1].id, agents[2].id, agents[0].id]
        );
    }

    #[test]
    fn empty_candidates_select_nothing() {
        let t = task(&[]);
        assert_eq!(RoundRobin::new().select(&t, &[]), None);
        assert_eq!(LeastRecentlyAssigned.select(&t, &[]), None);
        assert_eq!(CapabilityWeighted.select(&t, &[]), None);
    }

    #[test]
    fn least_recently_assigned_prefers_never_assigned_then_oldest() {
        let agents = vec![
            agent(&[], Some(30), 2),
            agent(&[], Some(10), 5),
            agent(&[], None, 0),
        ];
        let t = task(&[]);
        assert_eq!(LeastRecentlyAssigned.select(&t, &agents), Some(agents[2].id));
        assert_eq!(
            LeastRecentlyAssigned.select(&t, &agents[..2]),
            Some(agents[1].id)
        );
    }

    #[test]
    fn capability_weighted_prefers_specialist() {
        let agents = vec![
            agent(&["gpu", "cpu", "net"], None, 0),
            agent(&["gpu"], None, 3),
            agent(&["gpu", "cpu"], None, 0),
        ];
        let t = task(&["gpu"]);
        assert_eq!(CapabilityWeighted.select(&t, &agents), Some(agents[1].id));
    }

    #[rstest]
    #[case(ROUND_ROBIN)]
    #[case(LEAST_RECENTLY_ASSIGNED)]
    #[case(CAPABILITY_WEIGHTED)]
    fn strategies_resolve_by_name(#[case] name: &str) {
        assert_eq!(strategy_from_name(name).unwrap().name(), name);
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(matches!(
            strategy_from_name("random"),
            Err(CoreError::UnknownStrategy(name)) if name == "random"
        ));
    }
}
