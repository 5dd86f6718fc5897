// src/routing/mod.rs
//! Request routing
//!
//! - **Strategy**: round-robin, least-connections, random selection
//! - **Transport**: JSON over HTTP to a worker's `/api/process`
//! - **Router**: selection, in-flight bookkeeping and single failover
//! - **Stats**: process-wide routing counters

pub mod router;
pub mod stats;
pub mod strategy;
pub mod transport;

// Re-export commonly used types
pub use router::{RouteError, RouteErrorKind, RouteResponse, Router};
pub use stats::{RoutingStats, StatsSnapshot};
pub use strategy::{RoutingStrategy, Selector};
pub use transport::{HttpTransport, TransportError, WorkerTransport};
