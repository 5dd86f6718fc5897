// src/utils/config.rs
//! Coordinator configuration
//!
//! Loaded from an optional YAML file followed by environment overrides:
//!
//! ```text
//! fleet.yaml (or $FLEET_CONFIG)  →  FLEET__ROUTING__STRATEGY=random  →  CoordinatorConfig
//! ```
//!
//! Every agent type carries its own launch and scaling parameters; the other
//! sections tune the spawner, router, autoscaler loop and the gateway.

use crate::routing::strategy::RoutingStrategy;
use crate::utils::errors::{FleetError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "fleet.yaml";

/// Environment variable pointing at an alternative configuration file
pub const CONFIG_PATH_ENV: &str = "FLEET_CONFIG";

/// Launch and scaling parameters for one agent type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTypeConfig {
    /// Program to launch: a bare name resolved on `PATH`, or a path
    pub program: String,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for every instance
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for spawned processes
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// First port of this type's range `[base_port, base_port + max_instances)`
    pub base_port: u16,

    #[serde(default = "default_min_instances")]
    pub min_instances: usize,

    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Load fraction at or above which one instance is added
    #[serde(default = "default_spawn_threshold")]
    pub spawn_threshold: f64,

    /// Load fraction at or below which one instance is removed
    #[serde(default = "default_kill_threshold")]
    pub kill_threshold: f64,

    /// In-flight requests one instance is expected to absorb
    #[serde(default = "default_capacity_per_instance")]
    pub capacity_per_instance: usize,
}

fn default_min_instances() -> usize {
    1
}

fn default_max_instances() -> usize {
    3
}

fn default_spawn_threshold() -> f64 {
    0.8
}

fn default_kill_threshold() -> f64 {
    0.2
}

fn default_capacity_per_instance() -> usize {
    10
}

impl AgentTypeConfig {
    /// Minimal config for a program on a port range, scaling defaults elsewhere
    pub fn new(program: impl Into<String>, base_port: u16) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: HashMap::new(),
            work_dir: None,
            base_port,
            min_instances: default_min_instances(),
            max_instances: default_max_instances(),
            spawn_threshold: default_spawn_threshold(),
            kill_threshold: default_kill_threshold(),
            capacity_per_instance: default_capacity_per_instance(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_bounds(mut self, min_instances: usize, max_instances: usize) -> Self {
        self.min_instances = min_instances;
        self.max_instances = max_instances;
        self
    }

    pub fn with_thresholds(mut self, spawn_threshold: f64, kill_threshold: f64) -> Self {
        self.spawn_threshold = spawn_threshold;
        self.kill_threshold = kill_threshold;
        self
    }

    pub fn with_capacity(mut self, capacity_per_instance: usize) -> Self {
        self.capacity_per_instance = capacity_per_instance;
        self
    }

    /// Ports this type may bind, in scan order
    pub fn port_range(&self) -> std::ops::Range<u32> {
        let start = self.base_port as u32;
        start..start + self.max_instances as u32
    }

    fn validate(&self, name: &str) -> Result<()> {
        let fail = |msg: String| Err(FleetError::Config(format!("agent '{}': {}", name, msg)));

        if self.program.trim().is_empty() {
            return fail("program must not be empty".into());
        }
        if self.max_instances == 0 {
            return fail("max_instances must be at least 1".into());
        }
        if self.min_instances > self.max_instances {
            return fail(format!(
                "min_instances ({}) exceeds max_instances ({})",
                self.min_instances, self.max_instances
            ));
        }
        if self.port_range().end > u16::MAX as u32 + 1 {
            return fail(format!(
                "port range {}..{} overflows",
                self.base_port,
                self.port_range().end
            ));
        }
        for (label, value) in [
            ("spawn_threshold", self.spawn_threshold),
            ("kill_threshold", self.kill_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{} must be within [0, 1], got {}", label, value));
            }
        }
        if self.kill_threshold >= self.spawn_threshold {
            return fail(format!(
                "kill_threshold ({}) must be below spawn_threshold ({})",
                self.kill_threshold, self.spawn_threshold
            ));
        }
        if self.capacity_per_instance == 0 {
            return fail("capacity_per_instance must be at least 1".into());
        }
        Ok(())
    }
}

/// Environment variable carrying a spawned instance's port, e.g. `ODDS_FEED_PORT`
pub fn port_env_var(agent_type: &str) -> String {
    let name: String = agent_type
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}_PORT", name)
}

/// Request routing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    #[serde(default)]
    pub strategy: RoutingStrategy,

    /// Upper bound for one call to a worker
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RoutingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Process spawner timing and addressing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnerConfig {
    /// Host workers bind to and are reached on
    #[serde(default = "default_host")]
    pub host: String,

    /// Wait before each startup liveness probe
    #[serde(default = "default_grace_ms")]
    pub startup_grace_ms: u64,

    /// Number of grace-wait-then-probe rounds before giving up
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,

    /// Wait between graceful and forceful termination
    #[serde(default = "default_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_grace_ms() -> u64 {
    2_000
}

fn default_startup_attempts() -> u32 {
    2
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            startup_grace_ms: default_grace_ms(),
            startup_attempts: default_startup_attempts(),
            kill_grace_ms: default_grace_ms(),
        }
    }
}

impl SpawnerConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Autoscaling loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoscalerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    10
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl AutoscalerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Gateway listen address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_port() -> u16 {
    3200
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_format: LogFormat,

    /// Prometheus exporter listen address; disabled when absent
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

/// Top-level coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub agents: HashMap<String, AgentTypeConfig>,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub spawner: SpawnerConfig,

    #[serde(default)]
    pub autoscaler: AutoscalerConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl CoordinatorConfig {
    /// Load from `$FLEET_CONFIG` (or `fleet.yaml`) plus `FLEET__*` overrides
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load from a specific file (which may be absent) plus environment overrides
    ///
    /// The file is parsed as-is so map keys (agent type names, `env` variable
    /// names) keep their case. Environment overrides are case-folded by the
    /// `config` crate and therefore apply to every section except `agents`.
    pub fn load_from(path: &str) -> Result<Self> {
        debug!("Loading configuration from {}", path);

        let mut document = match std::fs::read_to_string(path) {
            Ok(text) => serde_yaml::from_str::<Value>(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not found, using defaults", path);
                Value::Null
            }
            Err(e) => return Err(e.into()),
        };
        if document.is_null() {
            document = Value::Object(Map::new());
        }

        let overrides: Value = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("FLEET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        merge_overrides(&mut document, scalar_sections(overrides));

        let config: Self = serde_json::from_value(document)
            .map_err(|e| FleetError::Config(format!("{}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document directly
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent agent definitions and timings
    pub fn validate(&self) -> Result<()> {
        for (name, agent) in &self.agents {
            if name.trim().is_empty() {
                return Err(FleetError::Config("agent type name must not be empty".into()));
            }
            agent.validate(name)?;
        }

        let mut ranges: Vec<(&String, std::ops::Range<u32>)> = self
            .agents
            .iter()
            .map(|(name, agent)| (name, agent.port_range()))
            .collect();
        ranges.sort_by_key(|(_, range)| range.start);
        for pair in ranges.windows(2) {
            let (first, a) = &pair[0];
            let (second, b) = &pair[1];
            if b.start < a.end {
                return Err(FleetError::Config(format!(
                    "port ranges of '{}' and '{}' overlap",
                    first, second
                )));
            }
        }

        if self.spawner.startup_attempts == 0 {
            return Err(FleetError::Config("spawner.startup_attempts must be at least 1".into()));
        }
        if self.routing.request_timeout_ms == 0 {
            return Err(FleetError::Config("routing.request_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn agent(&self, agent_type: &str) -> Result<&AgentTypeConfig> {
        self.agents
            .get(agent_type)
            .ok_or_else(|| FleetError::UnknownAgentType(agent_type.to_string()))
    }
}

/// Configuration file named by `$FLEET_CONFIG`, or [`DEFAULT_CONFIG_FILE`]
pub fn config_path() -> String {
    std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string())
}

/// Drop environment overrides aimed at `agents`, whose keys are case-sensitive
fn scalar_sections(overrides: Value) -> Value {
    match overrides {
        Value::Object(mut sections) => {
            if sections.remove("agents").is_some() {
                warn!("Ignoring FLEET__AGENTS__* overrides; agent types are defined in the file");
            }
            Value::Object(sections)
        }
        _ => Value::Object(Map::new()),
    }
}

/// Deep-merge `overrides` into `target`; tables merge, anything else replaces
fn merge_overrides(target: &mut Value, overrides: Value) {
    match (target, overrides) {
        (Value::Object(target), Value::Object(overrides)) => {
            for (key, value) in overrides {
                merge_overrides(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, overrides) => *target = overrides,
    }
}
