// src/utils/errors.rs
//! Error types for the fleet coordinator
//!
//! Errors fall into four families:
//!
//! - **Configuration**: unknown agent type, unresolvable program, invalid config
//! - **Capacity**: max instances reached, no free port (expected, recoverable)
//! - **Registry**: duplicate identifiers or ports
//! - **Lifecycle**: a spawned process died or never started listening
//!
//! Transport failures while routing live in
//! [`crate::routing::transport::TransportError`] and never escape `route()`.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, FleetError>;

/// Errors surfaced by registry, spawner and coordinator operations
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("instance {id} already registered for agent type {agent_type}")]
    DuplicateInstance { agent_type: String, id: String },

    #[error("port {port} already claimed by another {agent_type} instance")]
    DuplicatePort { agent_type: String, port: u16 },

    #[error("agent type {agent_type} is at its maximum of {max} instances")]
    MaxInstancesReached { agent_type: String, max: usize },

    #[error("no free port in range for agent type {agent_type}")]
    NoPortAvailable { agent_type: String },

    #[error("program '{program}' not found: {reason}")]
    ProgramNotFound { program: String, reason: String },

    #[error("spawn failed for {agent_type}: {reason}")]
    SpawnFailed { agent_type: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Capacity errors are expected under load and only skip a scaling cycle
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            FleetError::MaxInstancesReached { .. } | FleetError::NoPortAvailable { .. }
        )
    }
}

impl From<config::ConfigError> for FleetError {
    fn from(err: config::ConfigError) -> Self {
        FleetError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for FleetError {
    fn from(err: serde_yaml::Error) -> Self {
        FleetError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_classification() {
        let max = FleetError::MaxInstancesReached {
            agent_type: "odds".into(),
            max: 3,
        };
        let port = FleetError::NoPortAvailable {
            agent_type: "odds".into(),
        };
        assert!(max.is_capacity());
        assert!(port.is_capacity());
        assert!(!FleetError::UnknownAgentType("odds".into()).is_capacity());
    }

    #[test]
    fn test_error_messages() {
        let err = FleetError::DuplicatePort {
            agent_type: "odds".into(),
            port: 3201,
        };
        assert_eq!(
            err.to_string(),
            "port 3201 already claimed by another odds instance"
        );
    }
}
