// src/coordinator.rs
//! Coordinator: owns the registry and wires the fleet together
//!
//! One [`Registry`] is created here and shared by reference with the
//! spawner, router and autoscaler; dropping the coordinator drops the only
//! owner. Periodic work is driven by [`Coordinator::tick`]:
//!
//! ```text
//! health_check → reap_dead → ensure_minimum (per type) → autoscale (per type)
//! ```

use crate::fleet::autoscaler::{Autoscaler, ScalingAction};
use crate::fleet::instance::InstanceView;
use crate::fleet::ports::{PortProbe, TcpPortProbe};
use crate::fleet::process_manager::{CommandLauncher, ProcessLauncher};
use crate::fleet::registry::Registry;
use crate::fleet::spawner::{HealthReport, KillOutcome, ScaleReport, Spawner};
use crate::routing::router::{RouteError, RouteErrorKind, RouteResponse, Router};
use crate::routing::stats::StatsSnapshot;
use crate::routing::transport::{HttpTransport, WorkerTransport};
use crate::utils::config::CoordinatorConfig;
use crate::utils::errors::Result;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one [`Coordinator::tick`] did
#[derive(Debug)]
pub struct TickReport {
    pub health: HealthReport,
    pub reaped: Vec<String>,
    pub replenished: Vec<ScaleReport>,
    pub scaling: Vec<(String, ScalingAction)>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    agent_types: Vec<String>,
    registry: Arc<Registry>,
    spawner: Arc<Spawner>,
    router: Router,
    autoscaler: Autoscaler,
}

impl Coordinator {
    /// Coordinator over real processes, TCP probes and HTTP workers
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let host = config.spawner.host.clone();
        Self::with_components(
            config,
            Arc::new(CommandLauncher::new()),
            Arc::new(TcpPortProbe::new(host.clone())),
            Arc::new(HttpTransport::new(host)),
        )
    }

    /// Coordinator with explicit process, port and transport capabilities
    pub fn with_components(
        config: CoordinatorConfig,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn PortProbe>,
        transport: Arc<dyn WorkerTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let mut agent_types: Vec<String> = config.agents.keys().cloned().collect();
        agent_types.sort();

        let registry = Arc::new(Registry::new());
        let spawner = Arc::new(Spawner::new(
            Arc::clone(&registry),
            Arc::new(config.agents.clone()),
            config.spawner.clone(),
            launcher,
            probe,
        ));
        let router = Router::new(
            Arc::clone(&registry),
            transport,
            config.routing.strategy,
            config.routing.request_timeout(),
        );
        let autoscaler = Autoscaler::new(Arc::clone(&registry), Arc::clone(&spawner));

        info!("Coordinator configured for {} agent types: {:?}", agent_types.len(), agent_types);

        Ok(Self {
            config,
            agent_types,
            registry,
            spawner,
            router,
            autoscaler,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn agent_types(&self) -> &[String] {
        &self.agent_types
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn spawner(&self) -> &Arc<Spawner> {
        &self.spawner
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Bring every agent type up to its minimum
    pub async fn start(&self) -> Vec<ScaleReport> {
        let mut reports = Vec::with_capacity(self.agent_types.len());
        for agent_type in &self.agent_types {
            match self.spawner.ensure_minimum(agent_type).await {
                Ok(report) => {
                    if let Some(e) = &report.error {
                        warn!(
                            "{} started {}/{} instances: {}",
                            agent_type,
                            report.completed(),
                            report.requested,
                            e
                        );
                    }
                    reports.push(report);
                }
                Err(e) => warn!("Cannot start {}: {}", agent_type, e),
            }
        }
        info!("Fleet started with {} instances", self.registry.total_count());
        reports
    }

    /// One maintenance pass
    pub async fn tick(&self) -> TickReport {
        let health = self.spawner.health_check();
        let reaped = self.spawner.reap_dead().await;
        if !reaped.is_empty() {
            info!("Reaped {} dead instances", reaped.len());
        }

        let mut replenished = Vec::new();
        for agent_type in &self.agent_types {
            match self.spawner.ensure_minimum(agent_type).await {
                Ok(report) if report.requested > 0 => replenished.push(report),
                Ok(_) => {}
                Err(e) => warn!("Cannot replenish {}: {}", agent_type, e),
            }
        }

        let scaling = self.autoscaler.run_once(&self.agent_types).await;
        debug!(
            "Tick: {} checked, {} dead, {} instances",
            health.checked,
            health.dead.len(),
            self.registry.total_count()
        );

        TickReport {
            health,
            reaped,
            replenished,
            scaling,
        }
    }

    /// Router API; unknown agent types are reported, never raised
    pub async fn route(&self, agent_type: &str, payload: &Value) -> RouteResponse {
        if !self.config.agents.contains_key(agent_type) {
            warn!("Route requested for unknown agent type {}", agent_type);
            return RouteResponse::Error(RouteError::new(
                RouteErrorKind::UnknownAgentType,
                format!("unknown agent type: {}", agent_type),
                0,
            ));
        }
        self.router.route(agent_type, payload).await
    }

    pub fn instances(&self) -> Vec<InstanceView> {
        self.registry.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.router.stats().snapshot(&self.registry)
    }

    /// Tick on the autoscaler interval until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.config.autoscaler.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping control loop");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Kill every instance
    pub async fn shutdown(&self) -> Vec<(String, KillOutcome)> {
        let outcomes = self.spawner.shutdown_all().await;
        let unconfirmed = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == KillOutcome::Unconfirmed)
            .count();
        if unconfirmed > 0 {
            warn!("{} instances did not confirm exit", unconfirmed);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::instance::InstanceStatus;
    use crate::fleet::spawner::tests::{fast_settings, FakeLauncher, FakeProbe};
    use crate::routing::router::tests::FakeTransport;
    use crate::utils::config::AgentTypeConfig;
    use serde_json::json;

    fn coordinator(launcher: Arc<FakeLauncher>, transport: FakeTransport) -> Coordinator {
        let mut config = CoordinatorConfig::default();
        config.spawner = fast_settings();
        config.agents.insert(
            "odds".into(),
            AgentTypeConfig::new("odds-worker", 3201).with_bounds(2, 4),
        );
        config.agents.insert(
            "scorer".into(),
            AgentTypeConfig::new("scorer-worker", 3301).with_bounds(1, 2),
        );
        Coordinator::with_components(
            config,
            launcher,
            Arc::new(FakeProbe::default()),
            Arc::new(transport),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_spawns_minimums() {
        let coordinator = coordinator(Arc::new(FakeLauncher::default()), FakeTransport::default());
        let reports = coordinator.start().await;

        assert_eq!(reports.len(), 2);
        assert_eq!(coordinator.registry().count("odds"), 2);
        assert_eq!(coordinator.registry().count("scorer"), 1);
        assert_eq!(coordinator.instances().len(), 3);
    }

    #[tokio::test]
    async fn test_route_and_stats() {
        let coordinator = coordinator(Arc::new(FakeLauncher::default()), FakeTransport::default());
        coordinator.start().await;

        let response = coordinator.route("odds", &json!({"fixture": 12})).await;
        assert!(response.is_success());

        let response = coordinator.route("tennis", &json!({})).await;
        assert_eq!(response.error().unwrap().kind, RouteErrorKind::UnknownAgentType);

        let stats = coordinator.stats();
        assert_eq!(stats.total_routes, 1);
        assert_eq!(stats.successful_routes, 1);
        assert_eq!(stats.healthy_instances, 3);
    }

    #[tokio::test]
    async fn test_tick_replaces_dead_instances() {
        let launcher = Arc::new(FakeLauncher::default());
        let coordinator = coordinator(Arc::clone(&launcher), FakeTransport::default());
        coordinator.start().await;

        let dead_pid = {
            let processes = launcher.processes.lock();
            processes[0].die();
            processes[0].pid
        };

        let report = coordinator.tick().await;
        assert_eq!(report.health.dead.len(), 1);
        assert_eq!(report.reaped.len(), 1);
        assert_eq!(report.replenished.len(), 1);
        assert_eq!(coordinator.registry().count("odds"), 2);
        assert!(coordinator
            .instances()
            .iter()
            .all(|view| view.pid != Some(dead_pid) && view.status == InstanceStatus::Running));
    }

    #[tokio::test]
    async fn test_tick_restores_unhealthy_instance() {
        let coordinator = coordinator(
            Arc::new(FakeLauncher::default()),
            FakeTransport::failing(&[3301]),
        );
        coordinator.start().await;

        let response = coordinator.route("scorer", &json!({})).await;
        assert_eq!(response.error().unwrap().kind, RouteErrorKind::FailoverExhausted);
        assert!(coordinator.registry().list_healthy("scorer").is_empty());

        // the process is still alive, so the health check brings it back
        coordinator.tick().await;
        assert_eq!(coordinator.registry().list_healthy("scorer").len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let coordinator = coordinator(Arc::new(FakeLauncher::default()), FakeTransport::default());
        coordinator.start().await;

        coordinator
            .run(tokio::time::sleep(std::time::Duration::from_millis(50)))
            .await;

        let outcomes = coordinator.shutdown().await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(coordinator.registry().total_count(), 0);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = CoordinatorConfig::default();
        config.agents.insert(
            "odds".into(),
            AgentTypeConfig::new("odds-worker", 3201).with_bounds(3, 1),
        );
        let result = Coordinator::with_components(
            config,
            Arc::new(FakeLauncher::default()),
            Arc::new(FakeProbe::default()),
            Arc::new(FakeTransport::default()),
        );
        assert!(result.is_err());
    }
}
