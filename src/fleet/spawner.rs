// src/fleet/spawner.rs
//! Process spawner: the only component that creates or removes instances
//!
//! # Lifecycle
//!
//! ```text
//! spawn:  capacity check → port scan → launch → register(starting)
//!           → [grace wait → alive? → accepting?] × attempts → running
//!                              │ exited / never listened
//!                              └──────────→ unregister + SpawnFailed
//!
//! kill:   SIGTERM → grace wait → SIGKILL if alive → settle → unregister
//! ```
//!
//! Spawns of one agent type are serialized so the capacity and port checks
//! cannot race; kills and spawns of different types run concurrently. A
//! spawn dropped before reaching `running` removes its entry and kills the
//! process; an entry left in `starting` past the startup deadline is marked
//! dead by the health check.

use crate::fleet::instance::{Instance, InstanceStatus};
use crate::fleet::ports::PortProbe;
use crate::fleet::process_manager::{LaunchSpec, ProcessHandle, ProcessLauncher, Termination};
use crate::fleet::registry::Registry;
use crate::utils::config::{port_env_var, AgentTypeConfig, SpawnerConfig};
use crate::utils::errors::{FleetError, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Upper bound on the wait after a forceful kill
const KILL_SETTLE: Duration = Duration::from_millis(500);

/// Liveness polling interval while waiting for a process to exit
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Allowance per startup attempt for the connect probe itself
const STARTUP_PROBE_SLACK: Duration = Duration::from_secs(1);

/// Result of [`Spawner::kill`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The process is gone and the entry removed
    ConfirmedDead,
    /// The entry was removed but the process still answered a liveness probe
    Unconfirmed,
    /// No such instance; nothing to do
    NotFound,
}

/// Progress of a multi-step scale operation
#[derive(Debug)]
pub struct ScaleReport {
    pub agent_type: String,
    pub requested: usize,
    /// Ids of instances spawned (scale up) or removed (scale down)
    pub instances: Vec<String>,
    /// The failure that stopped the loop early, if any
    pub error: Option<FleetError>,
}

impl ScaleReport {
    fn new(agent_type: &str, requested: usize) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            requested,
            instances: Vec::new(),
            error: None,
        }
    }

    pub fn completed(&self) -> usize {
        self.instances.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed() == self.requested
    }
}

/// Result of [`Spawner::health_check`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub running: usize,
    /// Unhealthy instances whose process was still alive, now running again
    pub restored: usize,
    /// Ids found exited
    pub dead: Vec<String>,
}

/// Launches, probes and tears down worker processes
pub struct Spawner {
    registry: Arc<Registry>,
    agents: Arc<HashMap<String, AgentTypeConfig>>,
    settings: SpawnerConfig,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn PortProbe>,
    spawn_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Spawner {
    pub fn new(
        registry: Arc<Registry>,
        agents: Arc<HashMap<String, AgentTypeConfig>>,
        settings: SpawnerConfig,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            registry,
            agents,
            settings,
            launcher,
            probe,
            spawn_locks: DashMap::new(),
        }
    }

    pub fn agent(&self, agent_type: &str) -> Result<&AgentTypeConfig> {
        self.agents
            .get(agent_type)
            .ok_or_else(|| FleetError::UnknownAgentType(agent_type.to_string()))
    }

    /// Start one instance, on `port` or the first free port of the type's range
    pub async fn spawn(&self, agent_type: &str, port: Option<u16>) -> Result<Instance> {
        let agent = self.agent(agent_type)?;

        let lock = self
            .spawn_locks
            .entry(agent_type.to_string())
            .or_default()
            .clone();
        let _serialized = lock.lock().await;

        let current = self.registry.count(agent_type);
        if current >= agent.max_instances {
            return Err(FleetError::MaxInstancesReached {
                agent_type: agent_type.to_string(),
                max: agent.max_instances,
            });
        }

        let port = match port {
            Some(port) => {
                if self.registry.claimed_ports(agent_type).contains(&port) {
                    return Err(FleetError::DuplicatePort {
                        agent_type: agent_type.to_string(),
                        port,
                    });
                }
                port
            }
            None => self
                .find_available_port(agent_type)
                .ok_or_else(|| FleetError::NoPortAvailable {
                    agent_type: agent_type.to_string(),
                })?,
        };

        let spec = launch_spec(agent_type, agent, port);
        let process = self.launcher.launch(&spec)?;

        let instance = Instance::new(agent_type, port, Arc::clone(&process));
        let id = instance.id.clone();
        if let Err(e) = self.registry.register(agent_type, instance) {
            if let Err(kill_error) = process.terminate(Termination::Forceful) {
                warn!("Failed to kill unregistered process on port {}: {}", port, kill_error);
            }
            return Err(e);
        }
        let startup = StartupGuard {
            registry: &self.registry,
            agent_type,
            id: id.clone(),
            process: Arc::clone(&process),
            armed: true,
        };
        info!(
            "Spawned {} (pid {:?}) on port {}, waiting for startup",
            id,
            process.pid(),
            port
        );

        if let Err(reason) = self.await_startup(agent_type, &id, port, &process).await {
            warn!("{} failed to start: {}", id, reason);
            return Err(FleetError::SpawnFailed {
                agent_type: agent_type.to_string(),
                reason,
            });
        }

        let started = if self.registry.mark_healthy(agent_type, &id) {
            self.registry.get(agent_type, &id)
        } else {
            None
        };
        let Some(instance) = started else {
            return Err(FleetError::SpawnFailed {
                agent_type: agent_type.to_string(),
                reason: format!("{} was removed during startup", id),
            });
        };
        startup.disarm();

        metrics::counter!("fleet_spawns_total", "agent_type" => agent_type.to_string()).increment(1);
        self.record_instance_gauge(agent_type);
        info!("{} is running on port {}", id, port);
        Ok(instance)
    }

    /// Grace-wait-then-probe, bounded by `startup_attempts`
    async fn await_startup(
        &self,
        agent_type: &str,
        id: &str,
        port: u16,
        process: &Arc<dyn ProcessHandle>,
    ) -> std::result::Result<(), String> {
        let attempts = self.settings.startup_attempts.max(1);

        for attempt in 1..=attempts {
            tokio::time::sleep(self.settings.startup_grace()).await;

            if self.registry.get(agent_type, id).is_none() {
                return Err("removed during startup".to_string());
            }
            if !process.is_alive() {
                return Err(format!("process exited during startup (probe {})", attempt));
            }
            if self.probe.is_accepting(port).await {
                return Ok(());
            }
            debug!(
                "{} alive but not accepting on port {} (probe {}/{})",
                id, port, attempt, attempts
            );
        }

        Err(format!(
            "not accepting connections on port {} after {} probes",
            port, attempts
        ))
    }

    /// Longest a spawn may keep an entry in `starting`
    fn startup_deadline(&self) -> Duration {
        (self.settings.startup_grace() + STARTUP_PROBE_SLACK) * self.settings.startup_attempts.max(1)
    }

    /// Terminate an instance and always remove its entry
    pub async fn kill(&self, agent_type: &str, id: &str) -> KillOutcome {
        let Some(instance) = self.registry.get(agent_type, id) else {
            debug!("Kill requested for unknown instance {}", id);
            return KillOutcome::NotFound;
        };
        let process = instance.process;

        if let Err(e) = process.terminate(Termination::Graceful) {
            warn!("Failed to signal {}: {}", id, e);
        }

        let mut exited = wait_for_exit(&process, self.settings.kill_grace()).await;
        if !exited {
            debug!("{} still alive after grace period, sending SIGKILL", id);
            if let Err(e) = process.terminate(Termination::Forceful) {
                warn!("Failed to force-kill {}: {}", id, e);
            }
            exited = wait_for_exit(&process, KILL_SETTLE.min(self.settings.kill_grace())).await;
        }

        self.registry.unregister(agent_type, id);
        metrics::counter!("fleet_kills_total", "agent_type" => agent_type.to_string()).increment(1);
        self.record_instance_gauge(agent_type);

        if exited {
            info!("Killed {}", id);
            KillOutcome::ConfirmedDead
        } else {
            warn!(
                "{} (pid {:?}) did not confirm exit; entry removed anyway",
                id,
                process.pid()
            );
            KillOutcome::Unconfirmed
        }
    }

    /// First port in `[base_port, base_port + max_instances)` that is neither
    /// claimed by this type nor bound by anyone else
    pub fn find_available_port(&self, agent_type: &str) -> Option<u16> {
        let agent = self.agents.get(agent_type)?;
        let claimed = self.registry.claimed_ports(agent_type);

        let port = agent
            .port_range()
            .filter_map(|port| u16::try_from(port).ok())
            .filter(|port| !claimed.contains(port))
            .find(|port| self.probe.is_free(*port));

        if port.is_none() {
            debug!("No free port for {} ({} claimed)", agent_type, claimed.len());
        }
        port
    }

    /// Spawn up to `count` instances, stopping at the first failure
    pub async fn scale_up(&self, agent_type: &str, count: usize) -> ScaleReport {
        let mut report = ScaleReport::new(agent_type, count);

        for _ in 0..count {
            match self.spawn(agent_type, None).await {
                Ok(instance) => report.instances.push(instance.id),
                Err(e) => {
                    if e.is_capacity() {
                        debug!("Scale up of {} stopped: {}", agent_type, e);
                    } else {
                        warn!("Scale up of {} stopped: {}", agent_type, e);
                    }
                    report.error = Some(e);
                    break;
                }
            }
        }
        report
    }

    /// Remove up to `count` least-recently-used instances, never going
    /// below `min_instances`
    pub async fn scale_down(&self, agent_type: &str, count: usize) -> ScaleReport {
        let mut report = ScaleReport::new(agent_type, count);
        let min = match self.agent(agent_type) {
            Ok(agent) => agent.min_instances,
            Err(e) => {
                report.error = Some(e);
                return report;
            }
        };

        for _ in 0..count {
            if self.registry.count(agent_type) <= min {
                debug!("{} already at its minimum of {}", agent_type, min);
                break;
            }
            let Some(victim) = self.registry.least_recently_used(agent_type) else {
                break;
            };
            match self.kill(agent_type, &victim.id).await {
                KillOutcome::NotFound => break,
                KillOutcome::ConfirmedDead | KillOutcome::Unconfirmed => {
                    report.instances.push(victim.id)
                }
            }
        }
        report
    }

    /// Spawn whatever is missing to reach `min_instances`
    pub async fn ensure_minimum(&self, agent_type: &str) -> Result<ScaleReport> {
        let min = self.agent(agent_type)?.min_instances;
        let missing = min.saturating_sub(self.registry.count(agent_type));
        if missing > 0 {
            info!("{} below minimum, spawning {}", agent_type, missing);
        }
        Ok(self.scale_up(agent_type, missing).await)
    }

    /// Probe every settled instance: alive → running, exited → dead
    pub fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();

        for agent_type in self.registry.agent_types() {
            for instance in self.registry.list(&agent_type) {
                if instance.status == InstanceStatus::Starting {
                    if !self.startup_overdue(&instance) {
                        continue;
                    }
                    warn!("{} stuck in starting, marking dead", instance.id);
                    self.registry
                        .set_status(&agent_type, &instance.id, InstanceStatus::Dead);
                    report.checked += 1;
                    report.dead.push(instance.id);
                    continue;
                }
                report.checked += 1;

                if instance.process.is_alive() {
                    if instance.status != InstanceStatus::Running {
                        info!("{} is alive again, restoring to running", instance.id);
                        report.restored += 1;
                    }
                    self.registry.mark_healthy(&agent_type, &instance.id);
                    report.running += 1;
                } else {
                    if instance.status != InstanceStatus::Dead {
                        warn!("{} (pid {:?}) has exited", instance.id, instance.pid());
                    }
                    self.registry
                        .set_status(&agent_type, &instance.id, InstanceStatus::Dead);
                    report.dead.push(instance.id);
                }
            }
        }

        report
    }

    fn startup_overdue(&self, instance: &Instance) -> bool {
        (Utc::now() - instance.created_at)
            .to_std()
            .map(|age| age > self.startup_deadline())
            .unwrap_or(false)
    }

    /// Remove every instance marked dead
    pub async fn reap_dead(&self) -> Vec<String> {
        let mut reaped = Vec::new();
        for agent_type in self.registry.agent_types() {
            for instance in self.registry.list(&agent_type) {
                if instance.status == InstanceStatus::Dead
                    && self.kill(&agent_type, &instance.id).await != KillOutcome::NotFound
                {
                    reaped.push(instance.id);
                }
            }
        }
        reaped
    }

    /// Kill every tracked instance concurrently
    pub async fn shutdown_all(&self) -> Vec<(String, KillOutcome)> {
        let targets: Vec<(String, String)> = self
            .registry
            .agent_types()
            .into_iter()
            .flat_map(|agent_type| {
                self.registry
                    .list(&agent_type)
                    .into_iter()
                    .map(move |instance| (agent_type.clone(), instance.id))
            })
            .collect();

        info!("Shutting down {} instances", targets.len());
        let kills = targets.iter().map(|(agent_type, id)| async move {
            (id.clone(), self.kill(agent_type, id).await)
        });
        futures::future::join_all(kills).await
    }

    fn record_instance_gauge(&self, agent_type: &str) {
        metrics::gauge!("fleet_instances", "agent_type" => agent_type.to_string())
            .set(self.registry.count(agent_type) as f64);
    }
}

/// Owns a `starting` entry until startup succeeds. Dropped armed (failed
/// startup or a cancelled spawn future) it removes the entry and kills the
/// process.
struct StartupGuard<'a> {
    registry: &'a Registry,
    agent_type: &'a str,
    id: String,
    process: Arc<dyn ProcessHandle>,
    armed: bool,
}

impl StartupGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartupGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.registry.unregister(self.agent_type, &self.id);
        if self.process.is_alive() {
            if let Err(e) = self.process.terminate(Termination::Forceful) {
                warn!("Failed to kill failed instance {}: {}", self.id, e);
            }
        }
        debug!("Discarded {} after unfinished startup", self.id);
    }
}

fn launch_spec(agent_type: &str, agent: &AgentTypeConfig, port: u16) -> LaunchSpec {
    let mut env: Vec<(String, String)> = agent
        .env
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    env.push((port_env_var(agent_type), port.to_string()));

    LaunchSpec {
        agent_type: agent_type.to_string(),
        program: agent.program.clone(),
        args: agent.args.clone(),
        env,
        work_dir: agent.work_dir.clone(),
        port,
    }
}

/// Poll liveness until the process exits or `within` elapses
async fn wait_for_exit(process: &Arc<dyn ProcessHandle>, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if !process.is_alive() {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL.min(deadline - now)).await;
    }
}
