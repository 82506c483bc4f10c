//! Registry state and operations
//!
//! All mutations serialize through the single write lock; reads clone a
//! snapshot so enumeration never holds the lock across I/O. The health
//! scanner owns the degraded/stopped transitions and tells the broker which
//! instances went stale so their subscriptions can be freed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain_types::{AgentInstanceId, AgentTypeId, CellId, ProjectId};
use crate::support::types::{
    AgentTypeSpec, InstanceFilter, InstanceRecord, InstanceStatus,
};

/// Errors returned by registry operations
///
/// The `code()` values are contractual and travel on the wire.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown agent type: {type_id}")]
    UnknownType { type_id: AgentTypeId },

    #[error("instance already registered: {instance_id}")]
    DuplicateInstance { instance_id: AgentInstanceId },

    #[error("unknown instance: {instance_id}")]
    UnknownInstance { instance_id: AgentInstanceId },

    #[error("type {type_id} conflicts with live instances: {reason}")]
    Conflict { type_id: AgentTypeId, reason: String },

    #[error("broker endpoint not registered yet")]
    NotReady,
}

impl RegistryError {
    /// Contractual error code for the wire
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownType { .. } => "unknown_type",
            Self::DuplicateInstance { .. } => "duplicate_instance",
            Self::UnknownInstance { .. } => "unknown_instance",
            Self::Conflict { .. } => "conflict",
            Self::NotReady => "not_ready",
        }
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Outcome of a heartbeat
///
/// Unknown instances are stale clients, not errors: they are told to
/// re-register rather than failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAck {
    Recorded,
    ReregisterRequired,
}

/// Health and rebuild policy for the registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval clients are expected to heartbeat at
    pub heartbeat_interval: Duration,
    /// How often the health scanner runs; defaults to 3x the heartbeat
    pub scan_interval: Option<Duration>,
    /// Age past which an instance is degraded; defaults to 3x the heartbeat
    pub stale_after: Option<Duration>,
    /// Window within which reconnecting clients may replace their records
    pub rebuild_window: Duration,
    /// Environment-level configuration overrides, merged last
    pub env_overrides: Map<String, Value>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            scan_interval: None,
            stale_after: None,
            rebuild_window: Duration::from_secs(30),
            env_overrides: Map::new(),
        }
    }
}

impl RegistryConfig {
    fn effective_scan_interval(&self) -> Duration {
        self.scan_interval.unwrap_or(self.heartbeat_interval * 3)
    }

    fn effective_stale_after(&self) -> Duration {
        self.stale_after.unwrap_or(self.heartbeat_interval * 3)
    }

    fn effective_stop_after(&self) -> Duration {
        self.effective_stale_after() * 2
    }
}

#[derive(Default)]
struct RegistryState {
    types: HashMap<AgentTypeId, AgentTypeSpec>,
    instances: HashMap<AgentInstanceId, InstanceRecord>,
    broker_endpoint: Option<String>,
    /// Cell membership staged by the deployer before agents self-register
    expected: HashMap<AgentInstanceId, (CellId, ProjectId)>,
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    config: RegistryConfig,
    stale_tx: mpsc::UnboundedSender<AgentInstanceId>,
}

/// Shared handle to the support registry
#[derive(Clone)]
pub struct SupportRegistry {
    inner: Arc<RegistryInner>,
}

impl SupportRegistry {
    /// Creates a registry and the channel carrying stale-instance signals
    ///
    /// The broker consumes the receiver and frees the subscriptions of every
    /// instance id that arrives on it.
    pub fn new(config: RegistryConfig) -> (Self, mpsc::UnboundedReceiver<AgentInstanceId>) {
        let (stale_tx, stale_rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                config,
                stale_tx,
            }),
        };
        (registry, stale_rx)
    }

    /// Heartbeat interval clients of this registry should use
    pub fn heartbeat_interval(&self) -> Duration {
        self.inner.config.heartbeat_interval
    }

    /// Registers or replaces an agent type, idempotent by type id
    ///
    /// # Errors
    ///
    /// Returns `conflict` when live instances of the type exist and the new
    /// spec differs from the one they were stamped from.
    pub async fn register_type(&self, spec: AgentTypeSpec) -> Result<()> {
        let mut state = self.inner.state.write().await;
        if let Some(existing) = state.types.get(&spec.type_id) {
            if *existing == spec {
                return Ok(());
            }
            let live = state
                .instances
                .values()
                .filter(|r| r.type_id == spec.type_id && r.status.is_live())
                .count();
            if live > 0 {
                return Err(RegistryError::Conflict {
                    type_id: spec.type_id.clone(),
                    reason: format!("{live} live instance(s) bound to the prior definition"),
                });
            }
        }
        info!(type_id = %spec.type_id, operator = ?spec.operator, "agent type registered");
        state.types.insert(spec.type_id.clone(), spec);
        Ok(())
    }

    /// Creates an instance record bound to a registered type
    ///
    /// # Errors
    ///
    /// Returns `unknown_type` for unregistered types and `duplicate_instance`
    /// when a live record already holds the id. A stopped record is replaced,
    /// which is how reconnecting clients rebuild registry state.
    pub async fn register_instance(
        &self,
        instance_id: AgentInstanceId,
        type_id: AgentTypeId,
        config: Map<String, Value>,
    ) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let Some(spec) = state.types.get(&type_id) else {
            return Err(RegistryError::UnknownType { type_id });
        };
        if let Some(existing) = state.instances.get(&instance_id)
            && existing.status.is_live()
        {
            return Err(RegistryError::DuplicateInstance { instance_id });
        }
        let (ingress, egress) = (spec.ingress.clone(), spec.egress.clone());
        let (cell_id, project_id) = match state.expected.get(&instance_id) {
            Some((cell, project)) => (Some(cell.clone()), Some(project.clone())),
            None => (None, None),
        };
        let now = Utc::now();
        let record = InstanceRecord {
            instance_id: instance_id.clone(),
            type_id,
            cell_id,
            project_id,
            config,
            ingress,
            egress,
            registered_at: now,
            last_heartbeat: now,
            status: InstanceStatus::Registering,
        };
        debug!(instance_id = %instance_id, type_id = %record.type_id, "instance registered");
        state.instances.insert(instance_id, record);
        Ok(())
    }

    /// Records a heartbeat, updating status and freshness
    pub async fn heartbeat(
        &self,
        instance_id: &AgentInstanceId,
        status: InstanceStatus,
    ) -> HeartbeatAck {
        let mut state = self.inner.state.write().await;
        match state.instances.get_mut(instance_id) {
            Some(record) => {
                record.last_heartbeat = Utc::now();
                record.status = status;
                HeartbeatAck::Recorded
            }
            None => {
                debug!(instance_id = %instance_id, "heartbeat from unregistered instance");
                HeartbeatAck::ReregisterRequired
            }
        }
    }

    /// Returns the merged configuration for an instance
    ///
    /// Merge order is type defaults, then instance overrides, then
    /// environment overrides; last wins per top-level key.
    pub async fn resolve_config(&self, instance_id: &AgentInstanceId) -> Result<Map<String, Value>> {
        let state = self.inner.state.read().await;
        let record = state
            .instances
            .get(instance_id)
            .ok_or_else(|| RegistryError::UnknownInstance {
                instance_id: instance_id.clone(),
            })?;
        let mut merged = state
            .types
            .get(&record.type_id)
            .map(|spec| spec.default_config.clone())
            .unwrap_or_default();
        for (key, value) in &record.config {
            merged.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.inner.config.env_overrides {
            merged.insert(key.clone(), value.clone());
        }
        Ok(merged)
    }

    /// Advertised broker endpoint
    ///
    /// # Errors
    ///
    /// Returns `not_ready` before the broker has registered itself.
    pub async fn get_broker_endpoint(&self) -> Result<String> {
        let state = self.inner.state.read().await;
        state.broker_endpoint.clone().ok_or(RegistryError::NotReady)
    }

    /// Records the broker's advertised address; the broker calls this on startup
    pub async fn set_broker_endpoint(&self, endpoint: String) {
        info!(endpoint = %endpoint, "broker endpoint registered");
        self.inner.state.write().await.broker_endpoint = Some(endpoint);
    }

    /// Snapshot enumeration of instance records
    pub async fn list_instances(&self, filter: &InstanceFilter) -> Vec<InstanceRecord> {
        let state = self.inner.state.read().await;
        state
            .instances
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Looks up a single record
    pub async fn get_instance(&self, instance_id: &AgentInstanceId) -> Option<InstanceRecord> {
        self.inner.state.read().await.instances.get(instance_id).cloned()
    }

    /// Whether a type is currently registered
    pub async fn has_type(&self, type_id: &AgentTypeId) -> bool {
        self.inner.state.read().await.types.contains_key(type_id)
    }

    /// Stages cell membership ahead of an agent's self-registration
    pub async fn expect_instance(
        &self,
        instance_id: AgentInstanceId,
        cell_id: CellId,
        project_id: ProjectId,
    ) {
        let mut state = self.inner.state.write().await;
        if let Some(record) = state.instances.get_mut(&instance_id) {
            record.cell_id = Some(cell_id.clone());
            record.project_id = Some(project_id.clone());
        }
        state.expected.insert(instance_id, (cell_id, project_id));
    }

    /// Marks an instance stopped; the broker calls this on connection loss
    pub async fn mark_stopped(&self, instance_id: &AgentInstanceId) {
        let mut state = self.inner.state.write().await;
        if let Some(record) = state.instances.get_mut(instance_id) {
            record.status = InstanceStatus::Stopped;
        }
    }

    /// Drops an instance record entirely; the deployer calls this on cell stop
    pub async fn remove_instance(&self, instance_id: &AgentInstanceId) {
        let mut state = self.inner.state.write().await;
        state.instances.remove(instance_id);
        state.expected.remove(instance_id);
    }

    /// Spawns the periodic health scan
    ///
    /// Instances whose heartbeat age exceeds the stale threshold degrade;
    /// past twice the threshold they stop and their id is sent to the broker
    /// so subscriptions are freed.
    pub fn start_health_scanner(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let scan_interval = registry.inner.config.effective_scan_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.scan_once(Utc::now()).await,
                }
            }
        })
    }

    /// One health-scan pass at the given instant
    pub async fn scan_once(&self, now: DateTime<Utc>) {
        let stale_after = self.inner.config.effective_stale_after();
        let stop_after = self.inner.config.effective_stop_after();
        let mut newly_stopped = Vec::new();

        {
            let mut state = self.inner.state.write().await;
            for record in state.instances.values_mut() {
                if !record.status.is_live() {
                    continue;
                }
                let age = (now - record.last_heartbeat)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if age > stop_after {
                    warn!(instance_id = %record.instance_id, age_secs = age.as_secs(), "instance stopped: heartbeat lost");
                    record.status = InstanceStatus::Stopped;
                    newly_stopped.push(record.instance_id.clone());
                } else if age > stale_after && record.status != InstanceStatus::Degraded {
                    warn!(instance_id = %record.instance_id, age_secs = age.as_secs(), "instance degraded: heartbeat stale");
                    record.status = InstanceStatus::Degraded;
                }
            }
        }

        for instance_id in newly_stopped {
            let _ = self.inner.stale_tx.send(instance_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::types::{OperatorMode, ResourceHints};
    use serde_json::json;

    fn type_spec(id: &str) -> AgentTypeSpec {
        AgentTypeSpec {
            type_id: AgentTypeId::try_new(id.to_string()).unwrap(),
            capabilities: vec!["test".to_string()],
            default_config: Map::new(),
            ingress: None,
            egress: None,
            operator: OperatorMode::Spawn,
            resources: ResourceHints::default(),
        }
    }

    fn instance(id: &str) -> AgentInstanceId {
        AgentInstanceId::try_new(id.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_register_type_is_idempotent() {
        let (registry, _rx) = SupportRegistry::new(RegistryConfig::default());
        registry.register_type(type_spec("planner")).await.unwrap();
        registry.register_type(type_spec("planner")).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_type_conflicts_with_live_instances() {
        let (registry, _rx) = SupportRegistry::new(RegistryConfig::default());
        registry.register_type(type_spec("planner")).await.unwrap();
        registry
            .register_instance(
                instance("planner-1"),
                AgentTypeId::try_new("planner".to_string()).unwrap(),
                Map::new(),
            )
            .await
            .unwrap();

        let mut changed = type_spec("planner");
        changed.capabilities.push("extra".to_string());
        let err = registry.register_type(changed).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn test_register_instance_requires_known_type() {
        let (registry, _rx) = SupportRegistry::new(RegistryConfig::default());
        let err = registry
            .register_instance(
                instance("ocr-1"),
                AgentTypeId::try_new("ocr".to_string()).unwrap(),
                Map::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_type");
    }

    #[tokio::test]
    async fn test_duplicate_live_instance_rejected_but_stopped_replaced() {
        let (registry, _rx) = SupportRegistry::new(RegistryConfig::default());
        registry.register_type(type_spec("planner")).await.unwrap();
        let type_id = AgentTypeId::try_new("planner".to_string()).unwrap();

        registry
            .register_instance(instance("planner-1"), type_id.clone(), Map::new())
            .await
            .unwrap();
        let err = registry
            .register_instance(instance("planner-1"), type_id.clone(), Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "duplicate_instance");

        registry.mark_stopped(&instance("planner-1")).await;
        registry
            .register_instance(instance("planner-1"), type_id, Map::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_instance_requests_reregistration() {
        let (registry, _rx) = SupportRegistry::new(RegistryConfig::default());
        let ack = registry
            .heartbeat(&instance("ghost-1"), InstanceStatus::Ready)
            .await;
        assert_eq!(ack, HeartbeatAck::ReregisterRequired);
    }

    #[tokio::test]
    async fn test_resolve_config_merge_precedence() {
        let mut config = RegistryConfig::default();
        config.env_overrides.insert("level".to_string(), json!("env"));

        let (registry, _rx) = SupportRegistry::new(config);
        let mut spec = type_spec("planner");
        spec.default_config.insert("level".to_string(), json!("type"));
        spec.default_config.insert("model".to_string(), json!("base"));
        registry.register_type(spec).await.unwrap();

        let mut overrides = Map::new();
        overrides.insert("level".to_string(), json!("instance"));
        overrides.insert("temperature".to_string(), json!(0.2));
        registry
            .register_instance(
                instance("planner-1"),
                AgentTypeId::try_new("planner".to_string()).unwrap(),
                overrides,
            )
            .await
            .unwrap();

        let merged = registry.resolve_config(&instance("planner-1")).await.unwrap();
        assert_eq!(merged["level"], json!("env"));
        assert_eq!(merged["model"], json!("base"));
        assert_eq!(merged["temperature"], json!(0.2));
    }

    #[tokio::test]
    async fn test_broker_endpoint_not_ready_then_available() {
        let (registry, _rx) = SupportRegistry::new(RegistryConfig::default());
        let err = registry.get_broker_endpoint().await.unwrap_err();
        assert_eq!(err.code(), "not_ready");

        registry.set_broker_endpoint("127.0.0.1:7402".to_string()).await;
        assert_eq!(
            registry.get_broker_endpoint().await.unwrap(),
            "127.0.0.1:7402"
        );
    }

    #[tokio::test]
    async fn test_health_scan_degrades_then_stops() {
        let config = RegistryConfig {
            heartbeat_interval: Duration::from_millis(10),
            ..RegistryConfig::default()
        };
        let (registry, mut stale_rx) = SupportRegistry::new(config);
        registry.register_type(type_spec("planner")).await.unwrap();
        registry
            .register_instance(
                instance("planner-1"),
                AgentTypeId::try_new("planner".to_string()).unwrap(),
                Map::new(),
            )
            .await
            .unwrap();
        registry
            .heartbeat(&instance("planner-1"), InstanceStatus::Ready)
            .await;

        // Past the stale threshold (30ms) but not the stop threshold (60ms).
        let later = Utc::now() + chrono::Duration::milliseconds(40);
        registry.scan_once(later).await;
        let record = registry.get_instance(&instance("planner-1")).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Degraded);

        let much_later = Utc::now() + chrono::Duration::milliseconds(120);
        registry.scan_once(much_later).await;
        let record = registry.get_instance(&instance("planner-1")).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Stopped);
        assert_eq!(stale_rx.recv().await.unwrap(), instance("planner-1"));
    }

    #[tokio::test]
    async fn test_list_instances_filters_by_status() {
        let (registry, _rx) = SupportRegistry::new(RegistryConfig::default());
        registry.register_type(type_spec("worker")).await.unwrap();
        let type_id = AgentTypeId::try_new("worker".to_string()).unwrap();
        for name in ["w-1", "w-2", "w-3"] {
            registry
                .register_instance(instance(name), type_id.clone(), Map::new())
                .await
                .unwrap();
        }
        registry.heartbeat(&instance("w-2"), InstanceStatus::Ready).await;

        let ready = registry
            .list_instances(&InstanceFilter {
                status: Some(InstanceStatus::Ready),
                ..InstanceFilter::default()
            })
            .await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].instance_id, instance("w-2"));

        let all = registry.list_instances(&InstanceFilter::default()).await;
        assert_eq!(all.len(), 3);
    }
}
