use thiserror::Error;

/// Errors returned by core operations.
///
/// `NotFound` / `InvalidState` / `CapacityExceeded` are recoverable and go back
/// to the immediate caller. `Timeout` is never returned by a public call; it is
/// the error recorded on a task whose timer fired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} is {state}; cannot {operation}")]
    InvalidState {
        entity: &'static str,
        id: String,
        state: String,
        operation: &'static str,
    },

    #[error("capacity exceeded for {resource} (limit {limit})")]
    CapacityExceeded { resource: &'static str, limit: usize },

    #[error("task {id} exceeded its processing timeout")]
    Timeout { id: String },

    #[error("unknown assignment strategy: {0}")]
    UnknownStrategy(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(
        entity: &'static str,
        id: impl ToString,
        state: impl ToString,
        operation: &'static str,
    ) -> Self {
        CoreError::InvalidState {
            entity,
            id: id.to_string(),
            state: state.to_string(),
            operation,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}
