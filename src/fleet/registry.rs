// src/fleet/registry.rs
//! Instance registry: the authoritative record of every live worker
//!
//! # Ownership
//!
//! ```text
//! Spawner     → register / unregister / set_status
//! Router      → list_healthy / begin_request / finish_request / mark_unhealthy
//! Autoscaler  → list / active_connections / least_recently_used
//! ```
//!
//! Each operation is one shard-locked step on a `DashMap`. No guard ever
//! escapes a method, so nothing is held across an `.await` and callers that
//! suspend must re-validate (e.g. [`Registry::begin_request`] returns `false`
//! once the instance is gone).

use crate::fleet::instance::{Instance, InstanceStatus, InstanceView, RequestOutcome};
use crate::utils::errors::{FleetError, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Agent type → (instance id → instance)
#[derive(Debug, Default)]
pub struct Registry {
    types: DashMap<String, HashMap<String, Instance>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance; ids and ports must be unique within the type
    pub fn register(&self, agent_type: &str, instance: Instance) -> Result<()> {
        let mut instances = self.types.entry(agent_type.to_string()).or_default();

        if instances.contains_key(&instance.id) {
            return Err(FleetError::DuplicateInstance {
                agent_type: agent_type.to_string(),
                id: instance.id,
            });
        }
        if instances.values().any(|existing| existing.port == instance.port) {
            return Err(FleetError::DuplicatePort {
                agent_type: agent_type.to_string(),
                port: instance.port,
            });
        }

        debug!(
            "Registered {} on port {} ({})",
            instance.id, instance.port, instance.status
        );
        instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    /// Remove an instance, returning it if it was present
    pub fn unregister(&self, agent_type: &str, id: &str) -> Option<Instance> {
        let removed = self
            .types
            .get_mut(agent_type)
            .and_then(|mut instances| instances.remove(id));
        if removed.is_some() {
            debug!("Unregistered {}", id);
        }
        removed
    }

    pub fn get(&self, agent_type: &str, id: &str) -> Option<Instance> {
        self.types
            .get(agent_type)
            .and_then(|instances| instances.get(id).cloned())
    }

    /// All instances of a type, ordered by port
    pub fn list(&self, agent_type: &str) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self
            .types
            .get(agent_type)
            .map(|instances| instances.values().cloned().collect())
            .unwrap_or_default();
        instances.sort_by_key(|instance| instance.port);
        instances
    }

    /// Running instances of a type, ordered by port
    pub fn list_healthy(&self, agent_type: &str) -> Vec<Instance> {
        let mut instances = self.list(agent_type);
        instances.retain(Instance::is_healthy);
        instances
    }

    pub fn count(&self, agent_type: &str) -> usize {
        self.types
            .get(agent_type)
            .map(|instances| instances.len())
            .unwrap_or(0)
    }

    pub fn total_count(&self) -> usize {
        self.types.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn healthy_count(&self) -> usize {
        self.types
            .iter()
            .map(|entry| entry.value().values().filter(|i| i.is_healthy()).count())
            .sum()
    }

    /// Agent types that have (or had) registered instances
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types.iter().map(|entry| entry.key().clone()).collect();
        types.sort();
        types
    }

    pub fn claimed_ports(&self, agent_type: &str) -> HashSet<u16> {
        self.types
            .get(agent_type)
            .map(|instances| instances.values().map(|i| i.port).collect())
            .unwrap_or_default()
    }

    /// Sum of in-flight requests across a type
    pub fn active_connections(&self, agent_type: &str) -> u64 {
        self.types
            .get(agent_type)
            .map(|instances| instances.values().map(|i| i.active_connections).sum())
            .unwrap_or(0)
    }

    /// Set status in place; `false` if the instance no longer exists
    pub fn set_status(&self, agent_type: &str, id: &str, status: InstanceStatus) -> bool {
        self.with_instance(agent_type, id, |instance| {
            if instance.status != status {
                trace!("{}: {} -> {}", instance.id, instance.status, status);
            }
            instance.status = status;
        })
    }

    pub fn mark_healthy(&self, agent_type: &str, id: &str) -> bool {
        self.set_status(agent_type, id, InstanceStatus::Running)
    }

    pub fn mark_unhealthy(&self, agent_type: &str, id: &str) -> bool {
        self.set_status(agent_type, id, InstanceStatus::Unhealthy)
    }

    /// Count a request as in flight; `false` if the instance vanished
    pub fn begin_request(&self, agent_type: &str, id: &str) -> bool {
        self.with_instance(agent_type, id, |instance| {
            instance.active_connections += 1;
            instance.request_count += 1;
            instance.last_routed_at = Some(Utc::now());
        })
    }

    /// Release an in-flight slot and record the outcome
    pub fn finish_request(&self, agent_type: &str, id: &str, outcome: RequestOutcome) -> bool {
        self.with_instance(agent_type, id, |instance| {
            instance.active_connections = instance.active_connections.saturating_sub(1);
            match outcome {
                RequestOutcome::Success => instance.success_count += 1,
                RequestOutcome::Failure => instance.failure_count += 1,
                RequestOutcome::Cancelled => {}
            }
        })
    }

    /// Scale-down candidate: idle before busy, settled before `starting`,
    /// then never-routed before oldest `last_routed_at`, then lowest port
    pub fn least_recently_used(&self, agent_type: &str) -> Option<Instance> {
        self.list(agent_type).into_iter().min_by(|a, b| {
            (a.active_connections > 0)
                .cmp(&(b.active_connections > 0))
                .then(
                    (a.status == InstanceStatus::Starting)
                        .cmp(&(b.status == InstanceStatus::Starting)),
                )
                .then(a.last_routed_at.cmp(&b.last_routed_at))
                .then(a.port.cmp(&b.port))
        })
    }

    /// Serializable view of every instance, grouped by type then port
    pub fn snapshot(&self) -> Vec<InstanceView> {
        self.agent_types()
            .iter()
            .flat_map(|agent_type| self.list(agent_type))
            .map(|instance| instance.view())
            .collect()
    }

    fn with_instance(&self, agent_type: &str, id: &str, f: impl FnOnce(&mut Instance)) -> bool {
        match self.types.get_mut(agent_type) {
            Some(mut instances) => match instances.get_mut(id) {
                Some(instance) => {
                    f(instance);
                    true
                }
                None => false,
            },
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fleet::process_manager::{ProcessHandle, Termination};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// In-memory process whose liveness tests flip by hand
    #[derive(Debug)]
    pub(crate) struct FakeProcess {
        pub pid: u32,
        pub alive: AtomicBool,
        /// Ignore graceful termination, like a worker stuck in a handler
        pub stubborn: bool,
        /// Ignore every signal
        pub unkillable: bool,
    }

    impl FakeProcess {
        pub(crate) fn new(pid: u32) -> Arc<Self> {
            Arc::new(Self {
                pid,
                alive: AtomicBool::new(true),
                stubborn: false,
                unkillable: false,
            })
        }

        pub(crate) fn die(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    impl ProcessHandle for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn terminate(&self, mode: Termination) -> Result<()> {
            let ignored = self.unkillable || (self.stubborn && mode == Termination::Graceful);
            if !ignored {
                self.alive.store(false, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    pub(crate) fn running(agent_type: &str, port: u16) -> Instance {
        let mut instance = Instance::new(agent_type, port, FakeProcess::new(port as u32));
        instance.status = InstanceStatus::Running;
        instance
    }

    #[test]
    fn test_register_and_list() {
        let registry = Registry::new();
        registry.register("odds", running("odds", 3203)).unwrap();
        registry.register("odds", running("odds", 3201)).unwrap();

        let ports: Vec<u16> = registry.list("odds").iter().map(|i| i.port).collect();
        assert_eq!(ports, vec![3201, 3203]);
        assert_eq!(registry.count("odds"), 2);
        assert_eq!(registry.count("unknown"), 0);
        assert!(registry.list_healthy("unknown").is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = Registry::new();
        let instance = running("odds", 3201);
        registry.register("odds", instance.clone()).unwrap();

        let result = registry.register("odds", instance);
        assert!(matches!(result, Err(FleetError::DuplicateInstance { .. })));
        assert_eq!(registry.count("odds"), 1);
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let registry = Registry::new();
        registry.register("odds", running("odds", 3201)).unwrap();

        let mut other = running("odds", 3201);
        other.id = "odds-3201-other".into();
        let result = registry.register("odds", other);
        assert!(matches!(result, Err(FleetError::DuplicatePort { port: 3201, .. })));

        // other types may reuse the port number
        registry.register("scorer", running("scorer", 3201)).unwrap();
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = Registry::new();
        let instance = running("odds", 3201);
        let id = instance.id.clone();
        registry.register("odds", instance).unwrap();

        assert!(registry.unregister("odds", &id).is_some());
        assert!(registry.unregister("odds", &id).is_none());
        assert!(registry.unregister("unknown", &id).is_none());
    }

    #[test]
    fn test_health_marks() {
        let registry = Registry::new();
        let instance = running("odds", 3201);
        let id = instance.id.clone();
        registry.register("odds", instance).unwrap();

        assert!(registry.mark_unhealthy("odds", &id));
        assert!(registry.list_healthy("odds").is_empty());
        assert!(registry.mark_healthy("odds", &id));
        assert_eq!(registry.list_healthy("odds").len(), 1);

        registry.unregister("odds", &id);
        assert!(!registry.mark_unhealthy("odds", &id));
    }

    #[test]
    fn test_request_counters() {
        let registry = Registry::new();
        let instance = running("odds", 3201);
        let id = instance.id.clone();
        registry.register("odds", instance).unwrap();

        assert!(registry.begin_request("odds", &id));
        assert!(registry.begin_request("odds", &id));
        assert_eq!(registry.active_connections("odds"), 2);

        registry.finish_request("odds", &id, RequestOutcome::Success);
        registry.finish_request("odds", &id, RequestOutcome::Failure);

        let instance = registry.get("odds", &id).unwrap();
        assert_eq!(instance.active_connections, 0);
        assert_eq!(instance.request_count, 2);
        assert_eq!(instance.success_count, 1);
        assert_eq!(instance.failure_count, 1);
        assert!(instance.last_routed_at.is_some());

        assert!(!registry.begin_request("odds", "gone"));
    }

    #[test]
    fn test_least_recently_used_prefers_idle() {
        let registry = Registry::new();
        let busy = running("odds", 3201);
        let idle = running("odds", 3202);
        let (busy_id, idle_id) = (busy.id.clone(), idle.id.clone());
        registry.register("odds", busy).unwrap();
        registry.register("odds", idle).unwrap();

        // busy was never routed before this, idle was routed and finished
        registry.begin_request("odds", &idle_id);
        registry.finish_request("odds", &idle_id, RequestOutcome::Success);
        registry.begin_request("odds", &busy_id);

        let victim = registry.least_recently_used("odds").unwrap();
        assert_eq!(victim.id, idle_id);
    }

    #[test]
    fn test_least_recently_used_prefers_never_routed() {
        let registry = Registry::new();
        let routed = running("odds", 3201);
        let fresh = running("odds", 3202);
        let (routed_id, fresh_id) = (routed.id.clone(), fresh.id.clone());
        registry.register("odds", routed).unwrap();
        registry.register("odds", fresh).unwrap();

        registry.begin_request("odds", &routed_id);
        registry.finish_request("odds", &routed_id, RequestOutcome::Success);

        assert_eq!(registry.least_recently_used("odds").unwrap().id, fresh_id);
    }

    #[test]
    fn test_least_recently_used_skips_starting() {
        let registry = Registry::new();
        let starting = Instance::new("odds", 3201, FakeProcess::new(3201));
        let settled = running("odds", 3202);
        let settled_id = settled.id.clone();
        registry.register("odds", starting).unwrap();
        registry.register("odds", settled).unwrap();

        registry.begin_request("odds", &settled_id);
        registry.finish_request("odds", &settled_id, RequestOutcome::Success);

        assert_eq!(registry.least_recently_used("odds").unwrap().id, settled_id);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u16),
        Unregister(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (3200u16..3210).prop_map(Op::Register),
            (0usize..16).prop_map(Op::Unregister),
        ]
    }

    proptest! {
        #[test]
        fn prop_ports_stay_unique(ops in prop::collection::vec(op(), 1..64)) {
            let registry = Registry::new();
            let mut seq = 0u64;

            for op in ops {
                match op {
                    Op::Register(port) => {
                        seq += 1;
                        let mut instance = running("odds", port);
                        instance.id = format!("odds-{}-{}", port, seq);
                        let _ = registry.register("odds", instance);
                    }
                    Op::Unregister(index) => {
                        let ids: Vec<String> = registry.list("odds").into_iter().map(|i| i.id).collect();
                        if !ids.is_empty() {
                            registry.unregister("odds", &ids[index % ids.len()]);
                        }
                    }
                }

                let ports: Vec<u16> = registry.list("odds").iter().map(|i| i.port).collect();
                let unique: HashSet<u16> = ports.iter().copied().collect();
                prop_assert_eq!(ports.len(), unique.len());
            }
        }
    }
}
