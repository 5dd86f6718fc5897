// src/fleet/autoscaler.rs
//! Threshold autoscaling controller
//!
//! ```text
//! load = active_connections / (max_instances × capacity_per_instance)
//!
//! load ≥ spawn_threshold  and  current < max  →  spawn one
//! load ≤ kill_threshold   and  current > min  →  kill the least-recently-used
//! otherwise                                   →  hold
//! ```
//!
//! At most one action per agent type per invocation keeps the fleet from
//! oscillating; the caller decides how often to invoke.

use crate::fleet::registry::Registry;
use crate::fleet::spawner::{KillOutcome, Spawner};
use crate::utils::config::AgentTypeConfig;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the controller wants for one agent type
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingDecision {
    Spawn { load: f64 },
    Kill { id: String, load: f64 },
    Hold { load: f64 },
}

/// What actually happened for one agent type
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingAction {
    Spawned(String),
    Killed(String, KillOutcome),
    /// Spawn refused for capacity reasons; retried next cycle
    Skipped(String),
    Failed(String),
    Held,
}

pub struct Autoscaler {
    registry: Arc<Registry>,
    spawner: Arc<Spawner>,
}

impl Autoscaler {
    pub fn new(registry: Arc<Registry>, spawner: Arc<Spawner>) -> Self {
        Self { registry, spawner }
    }

    /// Fraction of the type's full capacity currently in flight
    pub fn load(&self, agent: &AgentTypeConfig, agent_type: &str) -> f64 {
        let capacity = (agent.max_instances * agent.capacity_per_instance) as f64;
        if capacity == 0.0 {
            return 0.0;
        }
        self.registry.active_connections(agent_type) as f64 / capacity
    }

    /// Decide without acting
    pub fn evaluate(&self, agent_type: &str, agent: &AgentTypeConfig) -> ScalingDecision {
        let load = self.load(agent, agent_type);
        let current = self.registry.count(agent_type);

        if load >= agent.spawn_threshold && current < agent.max_instances {
            return ScalingDecision::Spawn { load };
        }

        if load <= agent.kill_threshold && current > agent.min_instances {
            if let Some(victim) = self.registry.least_recently_used(agent_type) {
                return ScalingDecision::Kill {
                    id: victim.id,
                    load,
                };
            }
        }

        ScalingDecision::Hold { load }
    }

    /// Evaluate and apply one decision for `agent_type`
    pub async fn scale(&self, agent_type: &str) -> ScalingAction {
        let agent = match self.spawner.agent(agent_type) {
            Ok(agent) => agent,
            Err(e) => {
                warn!("Cannot autoscale {}: {}", agent_type, e);
                return ScalingAction::Failed(e.to_string());
            }
        };

        match self.evaluate(agent_type, agent) {
            ScalingDecision::Spawn { load } => {
                info!("{} load {:.2} ≥ {:.2}, spawning", agent_type, load, agent.spawn_threshold);
                match self.spawner.spawn(agent_type, None).await {
                    Ok(instance) => ScalingAction::Spawned(instance.id),
                    Err(e) if e.is_capacity() => {
                        debug!("Skipping {} scale-up this cycle: {}", agent_type, e);
                        ScalingAction::Skipped(e.to_string())
                    }
                    Err(e) => {
                        warn!("Scale-up of {} failed: {}", agent_type, e);
                        ScalingAction::Failed(e.to_string())
                    }
                }
            }
            ScalingDecision::Kill { id, load } => {
                info!("{} load {:.2} ≤ {:.2}, removing {}", agent_type, load, agent.kill_threshold, id);
                let outcome = self.spawner.kill(agent_type, &id).await;
                ScalingAction::Killed(id, outcome)
            }
            ScalingDecision::Hold { load } => {
                debug!("{} load {:.2}, holding", agent_type, load);
                ScalingAction::Held
            }
        }
    }

    /// One control-loop pass over the given agent types
    pub async fn run_once(&self, agent_types: &[String]) -> Vec<(String, ScalingAction)> {
        let mut actions = Vec::with_capacity(agent_types.len());
        for agent_type in agent_types {
            let action = self.scale(agent_type).await;
            actions.push((agent_type.clone(), action));
        }
        actions
    }
}
