//! Agent Registry - エージェントの登録とハートビート監視
//!
//! タスクについては何も知りません。
//!
//! # 状態遷移
//! registered(online) -> [heartbeat_timeout 経過] -> offline -> [heartbeat] -> online
//! -> [unregister] -> removed（レコード削除）
//!
//! # 実装
//! - エージェントは `BoundedMap`（登録順）に保持し、`max_agents` 超過時は最古を追い出す
//! - ハートビート監視はエージェントごとに 1 本の `TimerService` タイマー
//! - タイマー発火時はレコードの存在と heartbeat の世代を確認してから offline にする
//!   （発火直前に届いた heartbeat が先にロックを取った場合、その発火は古い）

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bounded::BoundedMap;
use crate::config::RegistryConfig;
use crate::domain::{Agent, AgentDescriptor, AgentId, DomainEvent, Liveness};
use crate::error::{CoreError, Result};
use crate::ports::{Clock, EventSink, IdGenerator};
use crate::timer::TimerService;

const ENTITY: &str = "agent";

/// Registry-side entry: the public snapshot plus the heartbeat generation the
/// live timer was armed for.
struct AgentRecord {
    agent: Agent,
    beat: u64,
}

struct Shared {
    agents: Mutex<BoundedMap<AgentId, AgentRecord>>,
    timers: TimerService<AgentId>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

/// In-memory agent registry. Cloning shares the same registry.
#[derive(Clone)]
pub struct AgentRegistry {
    shared: Arc<Shared>,
}

impl AgentRegistry {
    pub fn new(
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                agents: Mutex::new(BoundedMap::new(config.max_agents)),
                timers: TimerService::new(),
                config,
                clock,
                ids,
                events,
            }),
        }
    }

    /// Interval agents are expected to heartbeat at.
    pub fn heartbeat_interval(&self) -> Duration {
        self.shared.config.heartbeat_interval
    }

    pub fn max_agents(&self) -> usize {
        self.shared.config.max_agents
    }

    fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    fn arm_heartbeat(&self, agent_id: AgentId, beat: u64) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        self.shared.timers.arm(
            agent_id,
            self.shared.config.heartbeat_timeout,
            move || async move {
                if let Some(shared) = weak.upgrade() {
                    AgentRegistry { shared }
                        .handle_heartbeat_timeout(agent_id, beat)
                        .await;
                }
            },
        );
    }

    async fn handle_heartbeat_timeout(&self, agent_id: AgentId, beat: u64) {
        let flipped = {
            let mut agents = self.shared.agents.lock().await;
            match agents.get_mut(&agent_id) {
                Some(record) if record.beat != beat => {
                    debug!(%agent_id, beat, current = record.beat, "stale heartbeat timer ignored");
                    false
                }
                Some(record) if record.agent.is_online() => {
                    record.agent.liveness = Liveness::Offline;
                    true
                }
                Some(_) => false,
                None => {
                    debug!(%agent_id, "heartbeat timer fired for removed agent");
                    false
                }
            }
        };

        if flipped {
            warn!(%agent_id, timeout = ?self.shared.config.heartbeat_timeout, "agent missed heartbeat; marked offline");
            self.shared
                .events
                .emit(DomainEvent::AgentOffline { agent_id });
        }
    }

    /// Register a new agent, online, with its heartbeat timer armed.
    ///
    /// At `max_agents` the oldest registration is dropped first.
    pub async fn register(&self, descriptor: AgentDescriptor) -> Agent {
        let agent_id = self.shared.ids.agent_id();
        let now = self.now();
        let agent = Agent {
            id: agent_id,
            name: descriptor.name,
            capabilities: descriptor.capabilities,
            metadata: descriptor.metadata,
            liveness: Liveness::Online,
            registered_at: now,
            last_heartbeat: now,
            last_assigned_at: None,
            assignments: 0,
        };

        let mut events = Vec::new();
        {
            let mut agents = self.shared.agents.lock().await;
            let record = AgentRecord {
                agent: agent.clone(),
                beat: 0,
            };
            for (evicted_id, _) in agents.insert(agent_id, record) {
                self.shared.timers.disarm(&evicted_id);
                warn!(agent_id = %evicted_id, "agent registry full; evicted oldest agent");
                events.push(DomainEvent::AgentUnregistered {
                    agent_id: evicted_id,
                });
            }
            self.arm_heartbeat(agent_id, 0);
        }

        info!(%agent_id, name = ?agent.name, capabilities = ?agent.capabilities, "agent registered");
        events.push(DomainEvent::AgentRegistered {
            agent_id,
            name: agent.name.clone(),
        });
        for event in events {
            self.shared.events.emit(event);
        }
        agent
    }

    /// Refresh liveness. An offline agent comes back online.
    pub async fn heartbeat(&self, agent_id: AgentId) -> Result<()> {
        let now = self.now();
        let reconnected = {
            let mut agents = self.shared.agents.lock().await;
            let record = agents
                .get_mut(&agent_id)
                .ok_or_else(|| CoreError::not_found(ENTITY, agent_id))?;
            record.agent.last_heartbeat = now;
            let was_offline = !record.agent.is_online();
            record.agent.liveness = Liveness::Online;
            record.beat += 1;
            self.arm_heartbeat(agent_id, record.beat);
            was_offline
        };

        if reconnected {
            info!(%agent_id, "agent reconnected");
            self.shared
                .events
                .emit(DomainEvent::AgentReconnected { agent_id });
        }
        Ok(())
    }

    /// Remove an agent. Unknown ids are a no-op.
    pub async fn unregister(&self, agent_id: AgentId) {
        let removed = {
            let mut agents = self.shared.agents.lock().await;
            let removed = agents.remove(&agent_id);
            self.shared.timers.disarm(&agent_id);
            removed
        };

        match removed {
            Some(_) => {
                info!(%agent_id, "agent unregistered");
                self.shared
                    .events
                    .emit(DomainEvent::AgentUnregistered { agent_id });
            }
            None => debug!(%agent_id, "unregister of unknown agent ignored"),
        }
    }

    /// Online agents declaring every capability in `required`, in registration
    /// order. An empty requirement matches every online agent.
    pub async fn list_available(&self, required: &[String]) -> Vec<Agent> {
        let agents = self.shared.agents.lock().await;
        agents
            .values()
            .map(|record| &record.agent)
            .filter(|agent| agent.is_online() && agent.has_capabilities(required))
            .cloned()
            .collect()
    }

    pub async fn get(&self, agent_id: AgentId) -> Result<Agent> {
        let agents = self.shared.agents.lock().await;
        agents
            .get(&agent_id)
            .map(|record| record.agent.clone())
            .ok_or_else(|| CoreError::not_found(ENTITY, agent_id))
    }

    /// Every registered agent, online or not, in registration order.
    pub async fn list(&self) -> Vec<Agent> {
        let agents = self.shared.agents.lock().await;
        agents.values().map(|record| record.agent.clone()).collect()
    }

    /// Note that the coordinator handed `agent_id` a task.
    pub async fn record_assignment(&self, agent_id: AgentId) -> Result<()> {
        let now = self.now();
        let mut agents = self.shared.agents.lock().await;
        let record = agents
            .get_mut(&agent_id)
            .ok_or_else(|| CoreError::not_found(ENTITY, agent_id))?;
        record.agent.last_assigned_at = Some(now);
        record.agent.assignments += 1;
        Ok(())
    }

    /// Disarm every heartbeat timer. Records stay in place.
    pub async fn shutdown(&self) {
        let disarmed = self.shared.timers.clear();
        debug!(disarmed, "agent registry timers disarmed");
    }
}
