// src/routing/stats.rs
//! Process-wide routing statistics
//!
//! Counters only ever grow. Totals are atomics; per-type and per-instance
//! counts live in `DashMap`s so concurrent routes to different instances do
//! not contend on a single lock.

use crate::fleet::registry::Registry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RoutingStats {
    total_routes: AtomicU64,
    successful_routes: AtomicU64,
    failed_routes: AtomicU64,
    failovers: AtomicU64,
    by_type: DashMap<String, u64>,
    by_instance: DashMap<String, u64>,
}

impl RoutingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A caller-visible request was handed to an instance
    pub fn record_route(&self, agent_type: &str) {
        self.total_routes.fetch_add(1, Ordering::Relaxed);
        *self.by_type.entry(agent_type.to_string()).or_insert(0) += 1;
        metrics::counter!("fleet_routes_total", "agent_type" => agent_type.to_string()).increment(1);
    }

    /// One attempt (first try or failover) against an instance
    pub fn record_attempt(&self, instance_id: &str) {
        *self.by_instance.entry(instance_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_success(&self) {
        self.successful_routes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, agent_type: &str) {
        self.failed_routes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fleet_route_failures_total", "agent_type" => agent_type.to_string())
            .increment(1);
    }

    pub fn record_failover(&self, agent_type: &str) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fleet_failovers_total", "agent_type" => agent_type.to_string())
            .increment(1);
    }

    pub fn snapshot(&self, registry: &Registry) -> StatsSnapshot {
        let total_routes = self.total_routes.load(Ordering::Relaxed);
        let successful_routes = self.successful_routes.load(Ordering::Relaxed);
        let success_rate = if total_routes == 0 {
            0.0
        } else {
            successful_routes as f64 / total_routes as f64
        };

        StatsSnapshot {
            total_routes,
            successful_routes,
            failed_routes: self.failed_routes.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            success_rate,
            routes_by_type: collect(&self.by_type),
            attempts_by_instance: collect(&self.by_instance),
            healthy_instances: registry.healthy_count(),
            total_instances: registry.total_count(),
        }
    }
}

fn collect(map: &DashMap<String, u64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect()
}

/// Aggregate routing statistics for operational tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_routes: u64,
    pub successful_routes: u64,
    pub failed_routes: u64,
    pub failovers: u64,
    /// Fraction of routes that succeeded, 0 when nothing was routed
    pub success_rate: f64,
    pub routes_by_type: BTreeMap<String, u64>,
    pub attempts_by_instance: BTreeMap<String, u64>,
    pub healthy_instances: usize,
    pub total_instances: usize,
}
