// src/fleet/mod.rs
//! Worker fleet: registry, process lifecycle and autoscaling
//!
//! - **Registry**: authoritative record of every live instance per agent type
//! - **Process Manager**: launching and signalling OS subprocesses
//! - **Ports**: OS-level port availability and readiness probes
//! - **Spawner**: spawn / kill / scale / health check, the only writer of records
//! - **Autoscaler**: threshold control loop asking the spawner to scale
//!
//! # Architecture
//!
//! ```text
//!              ┌────────────┐  spawn / kill   ┌─────────────┐
//!              │ Autoscaler │ ──────────────→ │   Spawner   │──→ worker processes
//!              └─────┬──────┘                 └──────┬──────┘     (one port each)
//!                    │ load                          │ register / unregister
//!                    ▼                               ▼
//!              ┌─────────────────────────────────────────────┐
//!              │        Registry (type → id → Instance)      │
//!              └─────────────────────────────────────────────┘
//!                                   ▲ healthy set, counters
//!                                   │
//!                                Router
//! ```

pub mod autoscaler;
pub mod instance;
pub mod ports;
pub mod process_manager;
pub mod registry;
pub mod spawner;

// Re-export commonly used types
pub use autoscaler::{Autoscaler, ScalingAction, ScalingDecision};
pub use instance::{Instance, InstanceStatus, InstanceView, RequestOutcome};
pub use ports::{PortProbe, TcpPortProbe};
pub use process_manager::{CommandLauncher, LaunchSpec, ProcessHandle, ProcessLauncher, Termination};
pub use registry::Registry;
pub use spawner::{HealthReport, KillOutcome, ScaleReport, Spawner};
