// src/fleet/instance.rs
//! Instance records tracked by the registry

use crate::fleet::process_manager::ProcessHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Lifecycle status of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Launched, inside the startup grace period
    Starting,
    /// Alive and eligible for routing
    Running,
    /// A routed call failed; excluded until a health check restores it
    Unhealthy,
    /// The process has exited; awaiting removal
    Dead,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Dead => "dead",
        };
        f.write_str(label)
    }
}

/// How a routed request ended, for counter bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    Failure,
    /// The caller dropped the request before it completed
    Cancelled,
}

/// One running worker process of an agent type
#[derive(Debug, Clone)]
pub struct Instance {
    /// `{agent_type}-{port}-{spawn millis}`
    pub id: String,

    pub agent_type: String,

    pub port: u16,

    pub process: Arc<dyn ProcessHandle>,

    pub status: InstanceStatus,

    /// Requests ever routed here
    pub request_count: u64,

    /// Requests currently in flight
    pub active_connections: u64,

    pub success_count: u64,

    pub failure_count: u64,

    pub created_at: DateTime<Utc>,

    pub last_routed_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// A freshly launched instance in `starting` state
    pub fn new(agent_type: &str, port: u16, process: Arc<dyn ProcessHandle>) -> Self {
        let created_at = Utc::now();
        Self {
            id: instance_id(agent_type, port, created_at),
            agent_type: agent_type.to_string(),
            port,
            process,
            status: InstanceStatus::Starting,
            request_count: 0,
            active_connections: 0,
            success_count: 0,
            failure_count: 0,
            created_at,
            last_routed_at: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn view(&self) -> InstanceView {
        InstanceView {
            id: self.id.clone(),
            agent_type: self.agent_type.clone(),
            port: self.port,
            pid: self.pid(),
            status: self.status,
            request_count: self.request_count,
            active_connections: self.active_connections,
            success_count: self.success_count,
            failure_count: self.failure_count,
            created_at: self.created_at,
            last_routed_at: self.last_routed_at,
        }
    }
}

pub fn instance_id(agent_type: &str, port: u16, spawned_at: DateTime<Utc>) -> String {
    format!("{}-{}-{}", agent_type, port, spawned_at.timestamp_millis())
}

/// Serializable snapshot of an instance for listings and stats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: String,
    pub agent_type: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub status: InstanceStatus,
    pub request_count: u64,
    pub active_connections: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_routed_at: Option<DateTime<Utc>>,
}
