//! Configuration types.
//!
//! Every field is optional in TOML; missing values take the defaults below.
//! Durations are written as seconds (fractions allowed).
//!
//! ```toml
//! [tasks]
//! max_retries = 5
//! task_timeout = 120
//!
//! [agents]
//! heartbeat_timeout = 45
//!
//! [coordinator]
//! assignment_strategy = "least_recently_assigned"
//!
//! [bus]
//! max_queue_size = 500
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::impls::strategy::STRATEGY_NAMES;

/// Top-level configuration for a [`Core`](crate::app::Core).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub tasks: TaskStoreConfig,
    pub agents: RegistryConfig,
    pub coordinator: CoordinatorConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStoreConfig {
    /// Maximum number of task records held (any state).
    pub max_tasks: usize,
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub task_timeout: Duration,
    pub max_dead_letters: usize,
    #[serde(with = "duration_secs")]
    pub dead_letter_ttl: Duration,
    /// How long terminal tasks are kept before the sweep purges them.
    #[serde(with = "duration_secs")]
    pub task_retention: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            max_tasks: 10_000,
            max_retries: 3,
            task_timeout: Duration::from_secs(300),
            max_dead_letters: 1_000,
            dead_letter_ttl: Duration::from_secs(24 * 3600),
            task_retention: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Expected interval between heartbeats (advertised to agents).
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// Silence longer than this flips an agent offline.
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,
    pub max_agents: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            max_agents: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    pub assignment_strategy: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            assignment_strategy: "round_robin".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-queue capacity; the oldest message is dropped on overflow.
    pub max_queue_size: usize,
    pub max_kv_entries: usize,
    pub max_channels: usize,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    /// Fill ratio at which `BusMetrics` raises its near-limit flags.
    pub near_limit_ratio: f64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            max_kv_entries: 10_000,
            max_channels: 1_000,
            cleanup_interval: Duration::from_secs(60),
            near_limit_ratio: 0.9,
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("tasks.max_tasks", self.tasks.max_tasks)?;
        non_zero("tasks.max_dead_letters", self.tasks.max_dead_letters)?;
        non_zero_duration("tasks.task_timeout", self.tasks.task_timeout)?;
        non_zero_duration("tasks.cleanup_interval", self.tasks.cleanup_interval)?;

        non_zero("agents.max_agents", self.agents.max_agents)?;
        non_zero_duration("agents.heartbeat_interval", self.agents.heartbeat_interval)?;
        if self.agents.heartbeat_timeout <= self.agents.heartbeat_interval {
            return Err(ConfigError::Invalid {
                key: "agents.heartbeat_timeout",
                message: format!(
                    "must be greater than heartbeat_interval ({:?})",
                    self.agents.heartbeat_interval
                ),
            });
        }

        non_zero_duration("coordinator.poll_interval", self.coordinator.poll_interval)?;
        if !STRATEGY_NAMES.contains(&self.coordinator.assignment_strategy.as_str()) {
            return Err(ConfigError::Invalid {
                key: "coordinator.assignment_strategy",
                message: format!(
                    "unknown strategy {:?}, expected one of {:?}",
                    self.coordinator.assignment_strategy, STRATEGY_NAMES
                ),
            });
        }

        non_zero("bus.max_queue_size", self.bus.max_queue_size)?;
        non_zero("bus.max_kv_entries", self.bus.max_kv_entries)?;
        non_zero("bus.max_channels", self.bus.max_channels)?;
        non_zero_duration("bus.cleanup_interval", self.bus.cleanup_interval)?;
        if !(self.bus.near_limit_ratio > 0.0 && self.bus.near_limit_ratio <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "bus.near_limit_ratio",
                message: "must be in (0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

fn non_zero(key: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn non_zero_duration(key: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            key,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Serialize a `Duration` as (fractional) seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
