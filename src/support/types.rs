//! Registry data model: agent types, instances, and enumeration filters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain_types::{AgentInstanceId, AgentTypeId, CellId, ProjectId};

/// Lifecycle mode of an agent declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorMode {
    /// The deployer owns the process: launch, restart, tear down
    Spawn,
    /// Externally managed endpoint; only the logical instance is registered
    Call,
    /// External prerequisite probed for health before the cell is ready
    Await,
}

/// Scheduling and health hints carried by an agent type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// Per-type heartbeat override; the registry policy applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
}

/// Immutable template an instance is stamped from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTypeSpec {
    pub type_id: AgentTypeId,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub default_config: Map<String, Value>,
    /// Ingress channel expression, templated with runtime substitutions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<String>,
    /// Egress channel expression, templated with runtime substitutions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<String>,
    pub operator: OperatorMode,
    #[serde(default)]
    pub resources: ResourceHints,
}

/// Runtime status of an agent instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Registering,
    Ready,
    Running,
    Degraded,
    Stopped,
}

impl InstanceStatus {
    /// Whether the instance still counts toward the live set
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// Runtime binding of an agent type to a concrete process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: AgentInstanceId,
    pub type_id: AgentTypeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<CellId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
}

/// Snapshot-enumeration filter for `list_instances`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<CellId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<AgentTypeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
}

impl InstanceFilter {
    /// Whether a record passes this filter
    pub fn matches(&self, record: &InstanceRecord) -> bool {
        if let Some(cell) = &self.cell_id
            && record.cell_id.as_ref() != Some(cell)
        {
            return false;
        }
        if let Some(type_id) = &self.type_id
            && &record.type_id != type_id
        {
            return false;
        }
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }
        true
    }
}
