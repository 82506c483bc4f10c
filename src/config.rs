//! Orchestrator configuration: pool and cell declarations
//!
//! The deployer consumes these declarations; agents never read this file.
//! Invalid declarations are fatal to the affected cell only, except for
//! top-level parse failures, which abort startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::broker::BrokerConfig;
use crate::domain_types::{
    AgentInstanceId, AgentTypeId, CellId, ProjectId, QueueCapacity, RestartLimit,
};
use crate::support::{AgentTypeSpec, OperatorMode, RegistryConfig, ResourceHints};

/// Configuration errors; all map to the `config_error` category
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("duplicate agent type: {type_id}")]
    DuplicateType { type_id: String },

    #[error("duplicate instance declaration: {instance_id}")]
    DuplicateInstance { instance_id: String },

    #[error("cell {cell_id} references unknown agent type: {type_id}")]
    UnknownType { cell_id: String, type_id: String },

    #[error("instance {instance_id} depends on undeclared instance: {dependency}")]
    UnknownDependency {
        instance_id: String,
        dependency: String,
    },

    #[error("dependency cycle in cell {cell_id}")]
    DependencyCycle { cell_id: String },

    #[error("spawn type {type_id} declares no binary")]
    MissingBinary { type_id: String },

    #[error("await instance {instance_id} declares no probe endpoint")]
    MissingProbe { instance_id: String },

    #[error("invalid {what}: {value}")]
    InvalidValue { what: String, value: String },
}

/// Support section of the orchestrator config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportSection {
    #[serde(default = "default_support_bind")]
    pub bind: String,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_ms: Option<u64>,
    #[serde(default = "default_rebuild_window_ms")]
    pub rebuild_window_ms: u64,
}

impl Default for SupportSection {
    fn default() -> Self {
        Self {
            bind: default_support_bind(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            stale_after_ms: None,
            rebuild_window_ms: default_rebuild_window_ms(),
        }
    }
}

impl SupportSection {
    /// Builds the registry policy, folding in environment overrides
    pub fn registry_config(&self, env_overrides: Map<String, Value>) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            scan_interval: None,
            stale_after: self.stale_after_ms.map(Duration::from_millis),
            rebuild_window: Duration::from_millis(self.rebuild_window_ms),
            env_overrides,
        }
    }
}

/// Broker section of the orchestrator config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_broker_bind")]
    pub bind: String,
    #[serde(default = "default_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    #[serde(default = "default_publish_deadline_ms")]
    pub publish_deadline_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            bind: default_broker_bind(),
            subscriber_queue_capacity: default_queue_capacity(),
            publish_deadline_ms: default_publish_deadline_ms(),
        }
    }
}

impl BrokerSection {
    /// Builds the broker settings
    pub fn broker_config(&self, heartbeat_interval: Duration) -> Result<BrokerConfig, ConfigError> {
        let capacity = QueueCapacity::try_new(self.subscriber_queue_capacity).map_err(|_| {
            ConfigError::InvalidValue {
                what: "subscriber_queue_capacity".to_string(),
                value: self.subscriber_queue_capacity.to_string(),
            }
        })?;
        Ok(BrokerConfig {
            bind: self.bind.clone(),
            subscriber_queue_capacity: capacity,
            publish_deadline: Duration::from_millis(self.publish_deadline_ms),
            heartbeat_interval,
            ..BrokerConfig::default()
        })
    }
}

/// One agent type in the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTypeDecl {
    pub type_id: AgentTypeId,
    /// Binary launched for `spawn` instances of this type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    /// Arguments passed to the binary
    #[serde(default)]
    pub args: Vec<String>,
    pub operator: OperatorMode,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<String>,
    #[serde(default)]
    pub resources: ResourceHints,
}

impl AgentTypeDecl {
    /// The registry-facing slice of this declaration
    pub fn type_spec(&self) -> AgentTypeSpec {
        AgentTypeSpec {
            type_id: self.type_id.clone(),
            capabilities: self.capabilities.clone(),
            default_config: self.config.clone(),
            ingress: self.ingress.clone(),
            egress: self.egress.clone(),
            operator: self.operator,
            resources: self.resources.clone(),
        }
    }
}

/// Orchestration policy of a cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationPolicy {
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub max_retries: RestartLimit,
    #[serde(default = "default_health_check_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_true")]
    pub parallel_startup: bool,
    #[serde(default = "default_await_timeout_ms")]
    pub await_timeout_ms: u64,
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_base_ms: u64,
}

impl Default for OrchestrationPolicy {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_retries: RestartLimit::default(),
            health_check_interval_ms: default_health_check_ms(),
            parallel_startup: true,
            await_timeout_ms: default_await_timeout_ms(),
            stability_window_ms: default_stability_window_ms(),
            restart_backoff_base_ms: default_restart_backoff_ms(),
        }
    }
}

impl OrchestrationPolicy {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn restart_backoff_base(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_base_ms)
    }
}

/// One agent instance declared inside a cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecl {
    pub instance_id: AgentInstanceId,
    #[serde(rename = "type")]
    pub type_id: AgentTypeId,
    /// Overrides the type's operator mode when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<OperatorMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<AgentInstanceId>,
    /// `host:port` probed for `await` instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_endpoint: Option<String>,
}

/// A declared composition of cooperating agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellDecl {
    pub cell_id: CellId,
    #[serde(default)]
    pub policy: OrchestrationPolicy,
    pub agents: Vec<AgentDecl>,
}

/// Root of the orchestrator configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub project_id: ProjectId,
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_log: Option<PathBuf>,
    #[serde(default)]
    pub support: SupportSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub pool: Vec<AgentTypeDecl>,
    #[serde(default)]
    pub cells: Vec<CellDecl>,
}

impl OrchestratorConfig {
    /// Loads and validates a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-checks declarations before anything starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut type_ids = HashSet::new();
        for decl in &self.pool {
            if !type_ids.insert(decl.type_id.clone()) {
                return Err(ConfigError::DuplicateType {
                    type_id: decl.type_id.to_string(),
                });
            }
            if decl.operator == OperatorMode::Spawn && decl.binary.is_none() {
                return Err(ConfigError::MissingBinary {
                    type_id: decl.type_id.to_string(),
                });
            }
        }

        let mut instance_ids = HashSet::new();
        for cell in &self.cells {
            let declared: HashSet<_> = cell.agents.iter().map(|a| a.instance_id.clone()).collect();
            for agent in &cell.agents {
                if !instance_ids.insert(agent.instance_id.clone()) {
                    return Err(ConfigError::DuplicateInstance {
                        instance_id: agent.instance_id.to_string(),
                    });
                }
                let Some(type_decl) = self.pool.iter().find(|t| t.type_id == agent.type_id) else {
                    return Err(ConfigError::UnknownType {
                        cell_id: cell.cell_id.to_string(),
                        type_id: agent.type_id.to_string(),
                    });
                };
                let operator = agent.operator.unwrap_or(type_decl.operator);
                if operator == OperatorMode::Await && agent.probe_endpoint.is_none() {
                    return Err(ConfigError::MissingProbe {
                        instance_id: agent.instance_id.to_string(),
                    });
                }
                for dependency in &agent.depends_on {
                    if !declared.contains(dependency) {
                        return Err(ConfigError::UnknownDependency {
                            instance_id: agent.instance_id.to_string(),
                            dependency: dependency.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Looks up a type declaration
    pub fn type_decl(&self, type_id: &AgentTypeId) -> Option<&AgentTypeDecl> {
        self.pool.iter().find(|t| &t.type_id == type_id)
    }
}

/// Collects `AGEN_CONFIG_*` variables as environment-level config overrides
///
/// `AGEN_CONFIG_MODEL=opus` becomes the override `model: "opus"`; values that
/// parse as JSON keep their structure, anything else stays a string.
pub fn env_overrides() -> Map<String, Value> {
    let mut overrides = Map::new();
    for (key, value) in std::env::vars() {
        if let Some(name) = key.strip_prefix("AGEN_CONFIG_") {
            let parsed = serde_json::from_str(&value).unwrap_or(Value::String(value));
            overrides.insert(name.to_lowercase(), parsed);
        }
    }
    overrides
}

fn default_support_bind() -> String {
    "127.0.0.1:7401".to_string()
}

fn default_broker_bind() -> String {
    "127.0.0.1:7402".to_string()
}

fn default_heartbeat_ms() -> u64 {
    5_000
}

fn default_rebuild_window_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_publish_deadline_ms() -> u64 {
    5_000
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_health_check_ms() -> u64 {
    5_000
}

fn default_await_timeout_ms() -> u64 {
    30_000
}

fn default_stability_window_ms() -> u64 {
    10_000
}

fn default_restart_backoff_ms() -> u64 {
    500
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_true() -> bool {
    true
}
