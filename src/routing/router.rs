// src/routing/router.rs
//! Request router with single failover
//!
//! # Flow
//!
//! ```text
//! route(type, payload)
//!   │ healthy set empty ──────────────────────────→ NoInstancesAvailable
//!   ▼
//! select → begin_request → call ── ok ──→ Success (1 attempt)
//!                           │ err: release, failure++, mark unhealthy
//!                           ▼
//!   healthy set − failed ── empty / same pick ───→ FailoverExhausted
//!                           ▼
//! select → begin_request → call ── ok ──→ Success (2 attempts)
//!                           └── err ────────────→ RequestFailed
//! ```
//!
//! Every in-flight increment is paired with exactly one decrement through
//! [`InflightGuard`], whose `Drop` runs on success, error and cancellation.

use crate::fleet::instance::{Instance, RequestOutcome};
use crate::fleet::registry::Registry;
use crate::routing::stats::RoutingStats;
use crate::routing::strategy::{RoutingStrategy, Selector};
use crate::routing::transport::{TransportError, WorkerTransport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteErrorKind {
    /// The agent type is not configured
    UnknownAgentType,
    /// No instance of the type is healthy; nothing was attempted
    NoInstancesAvailable,
    /// The first attempt failed and no other healthy instance was left
    FailoverExhausted,
    /// Both the first attempt and the failover failed
    RequestFailed,
}

impl fmt::Display for RouteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RouteErrorKind::UnknownAgentType => "unknown agent type",
            RouteErrorKind::NoInstancesAvailable => "no instances available",
            RouteErrorKind::FailoverExhausted => "failover exhausted",
            RouteErrorKind::RequestFailed => "request failed",
        };
        f.write_str(label)
    }
}

/// Structured routing failure, rendered as `{status, error, timestamp}`
#[derive(Debug, Clone, PartialEq)]
pub struct RouteError {
    pub kind: RouteErrorKind,
    pub message: String,
    pub attempts: u8,
    pub timestamp: DateTime<Utc>,
}

impl RouteError {
    pub fn new(kind: RouteErrorKind, message: String, attempts: u8) -> Self {
        Self {
            kind,
            message,
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "status": "error",
            "error": self.message,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

/// Outcome of one caller-visible request
#[derive(Debug, Clone, PartialEq)]
pub enum RouteResponse {
    Success {
        instance_id: String,
        attempts: u8,
        body: Value,
    },
    Error(RouteError),
}

impl RouteResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, RouteResponse::Success { .. })
    }

    /// Wire form: the worker's JSON on success, the error object otherwise
    pub fn into_json(self) -> Value {
        match self {
            RouteResponse::Success { body, .. } => body,
            RouteResponse::Error(error) => error.to_json(),
        }
    }

    pub fn error(&self) -> Option<&RouteError> {
        match self {
            RouteResponse::Error(error) => Some(error),
            RouteResponse::Success { .. } => None,
        }
    }
}

/// Holds one in-flight slot on an instance; released on drop
struct InflightGuard<'a> {
    registry: &'a Registry,
    agent_type: &'a str,
    id: String,
    outcome: RequestOutcome,
}

impl<'a> InflightGuard<'a> {
    /// `None` if the instance vanished since it was selected
    fn acquire(registry: &'a Registry, agent_type: &'a str, id: &str) -> Option<Self> {
        registry.begin_request(agent_type, id).then(|| Self {
            registry,
            agent_type,
            id: id.to_string(),
            outcome: RequestOutcome::Cancelled,
        })
    }

    fn complete(mut self, outcome: RequestOutcome) {
        self.outcome = outcome;
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .finish_request(self.agent_type, &self.id, self.outcome);
    }
}

/// Routes requests to healthy instances
pub struct Router {
    registry: Arc<Registry>,
    transport: Arc<dyn WorkerTransport>,
    selector: Selector,
    stats: Arc<RoutingStats>,
    request_timeout: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn WorkerTransport>,
        strategy: RoutingStrategy,
        request_timeout: Duration,
    ) -> Self {
        info!("Router using {} strategy", strategy);
        Self {
            registry,
            transport,
            selector: Selector::new(strategy),
            stats: Arc::new(RoutingStats::new()),
            request_timeout,
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.selector.strategy()
    }

    pub fn stats(&self) -> &Arc<RoutingStats> {
        &self.stats
    }

    /// Pick a healthy instance of `agent_type`, skipping `exclude`
    pub fn select(&self, agent_type: &str, exclude: Option<&str>) -> Option<Instance> {
        let mut healthy = self.registry.list_healthy(agent_type);
        if let Some(excluded) = exclude {
            healthy.retain(|instance| instance.id != excluded);
        }
        self.selector.select(agent_type, &healthy).cloned()
    }

    /// Forward `payload` to an instance of `agent_type`, failing over once
    pub async fn route(&self, agent_type: &str, payload: &Value) -> RouteResponse {
        let request_id = Ulid::new();

        let Some(first) = self.select(agent_type, None) else {
            warn!(%request_id, "No healthy instances for {}", agent_type);
            return RouteResponse::Error(RouteError::new(
                RouteErrorKind::NoInstancesAvailable,
                format!("no instances available for agent type {}", agent_type),
                0,
            ));
        };

        self.stats.record_route(agent_type);
        debug!(%request_id, "Routing {} request to {}", agent_type, first.id);

        let first_error = match self.attempt(agent_type, &first, payload).await {
            Ok(body) => return self.succeed(first.id, 1, body),
            Err(e) => e,
        };
        self.fail_instance(agent_type, &first, &first_error, request_id);

        let failover = self
            .select(agent_type, Some(first.id.as_str()))
            .filter(|candidate| candidate.id != first.id);
        let Some(second) = failover else {
            self.stats.record_failure(agent_type);
            warn!(%request_id, "No failover target for {} after {}", agent_type, first.id);
            return RouteResponse::Error(RouteError::new(
                RouteErrorKind::FailoverExhausted,
                format!(
                    "failover exhausted for {}: {} failed ({}) and no other instance is healthy",
                    agent_type, first.id, first_error
                ),
                1,
            ));
        };

        self.stats.record_failover(agent_type);
        info!(%request_id, "Failing over {} request from {} to {}", agent_type, first.id, second.id);

        match self.attempt(agent_type, &second, payload).await {
            Ok(body) => self.succeed(second.id, 2, body),
            Err(second_error) => {
                self.fail_instance(agent_type, &second, &second_error, request_id);
                self.stats.record_failure(agent_type);
                RouteResponse::Error(RouteError::new(
                    RouteErrorKind::RequestFailed,
                    format!(
                        "request to {} failed on {} ({}) and on failover {} ({})",
                        agent_type, first.id, first_error, second.id, second_error
                    ),
                    2,
                ))
            }
        }
    }

    async fn attempt(
        &self,
        agent_type: &str,
        instance: &Instance,
        payload: &Value,
    ) -> Result<Value, TransportError> {
        let guard = InflightGuard::acquire(&self.registry, agent_type, &instance.id)
            .ok_or_else(|| TransportError::InstanceGone(instance.id.clone()))?;
        self.stats.record_attempt(&instance.id);

        let result = self
            .transport
            .call(instance.port, payload, self.request_timeout)
            .await;

        guard.complete(match result {
            Ok(_) => RequestOutcome::Success,
            Err(_) => RequestOutcome::Failure,
        });
        result
    }

    fn succeed(&self, instance_id: String, attempts: u8, body: Value) -> RouteResponse {
        self.stats.record_success();
        RouteResponse::Success {
            instance_id,
            attempts,
            body,
        }
    }

    fn fail_instance(
        &self,
        agent_type: &str,
        instance: &Instance,
        error: &TransportError,
        request_id: Ulid,
    ) {
        warn!(%request_id, "{} failed on port {}: {}", instance.id, instance.port, error);
        self.registry.mark_unhealthy(agent_type, &instance.id);
    }
}
