//! Domain model (IDs, tasks, agents, lifecycle events).

pub mod agent;
pub mod events;
pub mod ids;
pub mod task;

pub use agent::{Agent, AgentDescriptor, Liveness};
pub use events::DomainEvent;
pub use ids::{AgentId, Id, IdMarker, ParseIdError, TaskId};
pub use task::{NewTask, Priority, Task, TaskStatus, TaskType};
