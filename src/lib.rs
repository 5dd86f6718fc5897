// src/lib.rs
//! Agent Fleet Coordinator Library
//!
//! Keeps a pool of identical worker processes per agent type alive, scales
//! each pool with load, and routes JSON requests to a healthy instance with
//! a single automatic failover.
//!
//! # Architecture
//!
//! The coordinator is structured into several modules:
//!
//! - **fleet**: instance registry, process spawning, health and autoscaling
//! - **routing**: selection strategies, worker transport, router, statistics
//! - **coordinator**: owns the registry and drives the periodic control loop
//! - **gateway**: HTTP front door exposing the router
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and error types

pub mod coordinator;
pub mod fleet;
pub mod gateway;
pub mod observability;
pub mod routing;
pub mod utils;

// Re-export commonly used types
pub use coordinator::Coordinator;
pub use fleet::{Instance, InstanceStatus, KillOutcome, Registry, Spawner};
pub use routing::{RouteResponse, Router, RoutingStrategy};
pub use utils::config::{AgentTypeConfig, CoordinatorConfig};
pub use utils::errors::{FleetError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
