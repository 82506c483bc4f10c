//! Agent deployer: cells in, running processes out
//!
//! Translates cell declarations into running agents with the declared
//! lifecycle policy. Spawned processes are owned exclusively by the
//! deployer; call instances are registered only; await instances gate cell
//! readiness on an external health probe. Cell start is atomic: either
//! every declared agent reaches ready inside the startup timeout, or
//! everything started is rolled back in reverse order and the cell is
//! failed.

mod process;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::AgenClient;
use crate::client::{
    ENV_AGENT_ID, ENV_AGENT_TYPE, ENV_CONFIG_OVERRIDES, ENV_DATA_ROOT, ENV_PROJECT_ID,
    ENV_SESSION_LOG, ENV_SUPPORT_ENDPOINT, SHUTDOWN_KIND,
};
use crate::config::{AgentDecl, CellDecl, OrchestratorConfig};
use crate::domain_types::{AgentInstanceId, CellId, TopicName};
use crate::protocol::Envelope;
use crate::protocol::envelope::render_expression;
use crate::session_log::SessionLog;
use crate::support::{InstanceStatus, OperatorMode, RegistryError, SupportRegistry};
use process::{ProcessEvent, ProcessHandle, SpawnParams, spawn_supervised};

/// Control topic carrying cell lifecycle events
pub const CONTROL_TOPIC: &str = "agen.control";

/// Errors from cell lifecycle operations
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("unknown cell: {cell_id}")]
    UnknownCell { cell_id: CellId },

    #[error("cell {cell_id} is already running")]
    AlreadyRunning { cell_id: CellId },

    #[error("cell {cell_id} references unknown agent type {type_id}")]
    UnknownType { cell_id: CellId, type_id: String },

    #[error("dependency cycle in cell {cell_id}")]
    DependencyCycle { cell_id: CellId },

    #[error("instance {instance_id} missed the startup timeout")]
    StartupTimeout { instance_id: AgentInstanceId },

    #[error("await probe for {instance_id} failed within the await timeout")]
    AwaitTimeout { instance_id: AgentInstanceId },

    #[error("registry refused {instance_id}: {source}")]
    Registry {
        instance_id: AgentInstanceId,
        #[source]
        source: RegistryError,
    },
}

/// Result type for deployer operations
pub type Result<T> = std::result::Result<T, DeployError>;

/// Where a cell is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    Starting,
    Started,
    Degraded,
    Failed,
    Stopped,
}

struct CellRuntime {
    decl: CellDecl,
    status: CellStatus,
    processes: Vec<ProcessHandle>,
    instances: Vec<AgentInstanceId>,
}

/// The deployer: owns spawned processes and cell state
pub struct AgentDeployer {
    registry: SupportRegistry,
    config: Arc<OrchestratorConfig>,
    support_endpoint: String,
    session_log: SessionLog,
    control: Option<AgenClient>,
    cells: Arc<Mutex<HashMap<CellId, CellRuntime>>>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    events_task: JoinHandle<()>,
}

impl AgentDeployer {
    /// Creates a deployer
    ///
    /// The control client, when given, carries cell lifecycle events and the
    /// drain messages sent to spawned agents during cell stop.
    pub fn new(
        registry: SupportRegistry,
        config: Arc<OrchestratorConfig>,
        support_endpoint: String,
        session_log: SessionLog,
        control: Option<AgenClient>,
        cancel: CancellationToken,
    ) -> Self {
        let cells: Arc<Mutex<HashMap<CellId, CellRuntime>>> = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ProcessEvent>();

        let events_task = {
            let cells = cells.clone();
            let registry = registry.clone();
            let control = control.clone();
            let session_log = session_log.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events_rx.recv() => match event {
                            Some(event) => event,
                            None => break,
                        },
                    };
                    let instance_id = match &event {
                        ProcessEvent::Exhausted { instance_id }
                        | ProcessEvent::Unstable { instance_id } => instance_id.clone(),
                    };
                    registry
                        .heartbeat(&instance_id, InstanceStatus::Degraded)
                        .await;
                    let mut cells = cells.lock().await;
                    if let Some((cell_id, runtime)) = cells
                        .iter_mut()
                        .find(|(_, r)| r.instances.contains(&instance_id))
                    {
                        warn!(cell_id = %cell_id, instance_id = %instance_id, "cell degraded");
                        session_log.warn(
                            "deployer",
                            format!("cell {cell_id} degraded: {instance_id} gave out"),
                        );
                        runtime.status = CellStatus::Degraded;
                        publish_cell_event(&control, "cell_degraded", cell_id).await;
                    }
                }
            })
        };

        Self {
            registry,
            config,
            support_endpoint,
            session_log,
            control,
            cells,
            events_tx,
            events_task,
        }
    }

    /// Status of a cell, if it was ever started
    pub async fn cell_status(&self, cell_id: &CellId) -> Option<CellStatus> {
        self.cells.lock().await.get(cell_id).map(|r| r.status)
    }

    /// Starts every declared cell; returns how many came up
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for cell in &self.config.cells {
            match self.start_cell(&cell.cell_id).await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(cell_id = %cell.cell_id, error = %e, "cell failed to start");
                    self.session_log
                        .error("deployer", format!("cell {} failed: {e}", cell.cell_id));
                }
            }
        }
        started
    }

    /// Runs the cell-start protocol for one cell
    pub async fn start_cell(&self, cell_id: &CellId) -> Result<()> {
        let decl = self
            .config
            .cells
            .iter()
            .find(|c| &c.cell_id == cell_id)
            .cloned()
            .ok_or_else(|| DeployError::UnknownCell {
                cell_id: cell_id.clone(),
            })?;

        {
            let cells = self.cells.lock().await;
            if let Some(runtime) = cells.get(cell_id)
                && matches!(
                    runtime.status,
                    CellStatus::Starting | CellStatus::Started | CellStatus::Degraded
                )
            {
                return Err(DeployError::AlreadyRunning {
                    cell_id: cell_id.clone(),
                });
            }
        }

        // 1. every referenced type must exist in the registry
        for agent in &decl.agents {
            if !self.registry.has_type(&agent.type_id).await {
                self.record_status(&decl, CellStatus::Failed, vec![], vec![])
                    .await;
                return Err(DeployError::UnknownType {
                    cell_id: cell_id.clone(),
                    type_id: agent.type_id.to_string(),
                });
            }
        }

        info!(cell_id = %cell_id, agents = decl.agents.len(), "starting cell");
        self.session_log
            .info("deployer", format!("starting cell {cell_id}"));

        // 3. dependency order; unconstrained instances share a layer
        let layers = dependency_layers(&decl)?;
        let deadline = tokio::time::Instant::now() + decl.policy.startup_timeout();

        let mut processes: Vec<ProcessHandle> = Vec::new();
        let mut instances: Vec<AgentInstanceId> = Vec::new();

        for layer in layers {
            // 4. instances with no unmet dependency start in parallel
            let startups = layer
                .iter()
                .map(|agent| self.start_agent(&decl, agent, deadline));
            let results = futures::future::join_all(startups).await;

            let mut awaiting_ready: Vec<AgentInstanceId> = Vec::new();
            let mut first_error = None;
            for (agent, result) in layer.iter().zip(results) {
                instances.push(agent.instance_id.clone());
                match result {
                    Ok(Some(handle)) => {
                        processes.push(handle);
                        awaiting_ready.push(agent.instance_id.clone());
                    }
                    Ok(None) => {}
                    Err(e) => first_error = first_error.or(Some(e)),
                }
            }
            if let Some(e) = first_error {
                self.rollback(&decl, processes, instances).await;
                return Err(e);
            }

            // 5. spawned instances of this layer must report ready in time
            for instance_id in awaiting_ready {
                if !self.wait_ready(&instance_id, deadline).await {
                    self.rollback(&decl, processes, instances).await;
                    return Err(DeployError::StartupTimeout { instance_id });
                }
            }
        }

        self.record_status(&decl, CellStatus::Started, processes, instances)
            .await;
        info!(cell_id = %cell_id, "cell started");
        self.session_log
            .info("deployer", format!("cell {cell_id} started"));
        publish_cell_event(&self.control, "cell_started", cell_id).await;
        Ok(())
    }

    /// Runs the cell-stop protocol: drain, wait, terminate laggards, deregister
    pub async fn stop_cell(&self, cell_id: &CellId) -> Result<()> {
        let runtime = {
            let mut cells = self.cells.lock().await;
            cells.remove(cell_id).ok_or_else(|| DeployError::UnknownCell {
                cell_id: cell_id.clone(),
            })?
        };

        info!(cell_id = %cell_id, "stopping cell");
        self.session_log
            .info("deployer", format!("stopping cell {cell_id}"));

        for handle in runtime.processes.into_iter().rev() {
            self.send_drain(&handle.instance_id).await;
            handle.stop().await;
        }
        for instance_id in &runtime.instances {
            self.registry.remove_instance(instance_id).await;
        }

        let mut cells = self.cells.lock().await;
        cells.insert(
            cell_id.clone(),
            CellRuntime {
                decl: runtime.decl,
                status: CellStatus::Stopped,
                processes: Vec::new(),
                instances: Vec::new(),
            },
        );
        drop(cells);

        publish_cell_event(&self.control, "cell_stopped", cell_id).await;
        Ok(())
    }

    /// Stops every running cell, most recently started first
    pub async fn stop_all(&self) {
        let cell_ids: Vec<CellId> = {
            let cells = self.cells.lock().await;
            cells
                .iter()
                .filter(|(_, r)| {
                    matches!(
                        r.status,
                        CellStatus::Starting | CellStatus::Started | CellStatus::Degraded
                    )
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for cell_id in cell_ids {
            if let Err(e) = self.stop_cell(&cell_id).await {
                warn!(cell_id = %cell_id, error = %e, "cell stop failed");
            }
        }
        self.events_task.abort();
    }

    /// Starts one instance; `Some(handle)` means a spawned process to await
    async fn start_agent(
        &self,
        decl: &CellDecl,
        agent: &AgentDecl,
        deadline: tokio::time::Instant,
    ) -> Result<Option<ProcessHandle>> {
        self.registry
            .expect_instance(
                agent.instance_id.clone(),
                decl.cell_id.clone(),
                self.config.project_id.clone(),
            )
            .await;

        match self.operator_of(agent) {
            OperatorMode::Spawn => self.launch(decl, agent).map(Some),
            OperatorMode::Call => {
                self.register_external(agent).await?;
                Ok(None)
            }
            OperatorMode::Await => {
                let probe_deadline = tokio::time::Instant::now()
                    + decl
                        .policy
                        .await_timeout()
                        .min(deadline.saturating_duration_since(tokio::time::Instant::now()));
                let endpoint = agent.probe_endpoint.clone().unwrap_or_default();
                if !probe_until(&endpoint, probe_deadline).await {
                    return Err(DeployError::AwaitTimeout {
                        instance_id: agent.instance_id.clone(),
                    });
                }
                self.register_external(agent).await?;
                Ok(None)
            }
        }
    }

    fn operator_of(&self, agent: &AgentDecl) -> OperatorMode {
        agent.operator.unwrap_or_else(|| {
            self.config
                .type_decl(&agent.type_id)
                .map(|t| t.operator)
                .unwrap_or(OperatorMode::Call)
        })
    }

    /// Cell overrides plus the rendered ingress/egress expressions
    fn resolved_overrides(&self, agent: &AgentDecl) -> Map<String, Value> {
        let type_decl = self.config.type_decl(&agent.type_id);
        let mut overrides = agent.config.clone();
        let ingress = agent
            .ingress
            .clone()
            .or_else(|| type_decl.and_then(|t| t.ingress.clone()));
        let egress = agent
            .egress
            .clone()
            .or_else(|| type_decl.and_then(|t| t.egress.clone()));
        for (key, expression) in [("ingress", ingress), ("egress", egress)] {
            if let Some(expression) = expression {
                let rendered = render_expression(
                    &expression,
                    &agent.instance_id.to_string(),
                    &agent.type_id.to_string(),
                    &self.config.project_id.to_string(),
                );
                overrides.insert(key.to_string(), Value::String(rendered));
            }
        }
        overrides
    }

    fn launch(&self, decl: &CellDecl, agent: &AgentDecl) -> Result<ProcessHandle> {
        let type_decl =
            self.config
                .type_decl(&agent.type_id)
                .ok_or_else(|| DeployError::UnknownType {
                    cell_id: decl.cell_id.clone(),
                    type_id: agent.type_id.to_string(),
                })?;
        let binary = type_decl
            .binary
            .clone()
            .ok_or_else(|| DeployError::UnknownType {
                cell_id: decl.cell_id.clone(),
                type_id: agent.type_id.to_string(),
            })?;

        let overrides = self.resolved_overrides(agent);
        let overrides_json =
            serde_json::to_string(&overrides).unwrap_or_else(|_| "{}".to_string());
        let env = vec![
            (ENV_AGENT_ID.to_string(), agent.instance_id.to_string()),
            (ENV_AGENT_TYPE.to_string(), agent.type_id.to_string()),
            (ENV_PROJECT_ID.to_string(), self.config.project_id.to_string()),
            (ENV_SUPPORT_ENDPOINT.to_string(), self.support_endpoint.clone()),
            (
                ENV_DATA_ROOT.to_string(),
                self.config.data_root.display().to_string(),
            ),
            (
                ENV_SESSION_LOG.to_string(),
                self.session_log.path().display().to_string(),
            ),
            (ENV_CONFIG_OVERRIDES.to_string(), overrides_json),
        ];

        Ok(spawn_supervised(
            SpawnParams {
                instance_id: agent.instance_id.clone(),
                binary,
                args: type_decl.args.clone(),
                env,
                max_retries: decl.policy.max_retries.as_u32(),
                restart_backoff_base: decl.policy.restart_backoff_base(),
                stability_window: decl.policy.stability_window(),
                shutdown_timeout: decl.policy.shutdown_timeout(),
            },
            self.session_log.clone(),
            self.events_tx.clone(),
        ))
    }

    async fn register_external(&self, agent: &AgentDecl) -> Result<()> {
        let overrides = self.resolved_overrides(agent);
        self.registry
            .register_instance(agent.instance_id.clone(), agent.type_id.clone(), overrides)
            .await
            .map_err(|source| DeployError::Registry {
                instance_id: agent.instance_id.clone(),
                source,
            })?;
        self.registry
            .heartbeat(&agent.instance_id, InstanceStatus::Ready)
            .await;
        Ok(())
    }

    async fn wait_ready(
        &self,
        instance_id: &AgentInstanceId,
        deadline: tokio::time::Instant,
    ) -> bool {
        loop {
            if let Some(record) = self.registry.get_instance(instance_id).await
                && matches!(record.status, InstanceStatus::Ready | InstanceStatus::Running)
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn rollback(
        &self,
        decl: &CellDecl,
        processes: Vec<ProcessHandle>,
        instances: Vec<AgentInstanceId>,
    ) {
        warn!(cell_id = %decl.cell_id, "rolling back cell start");
        self.session_log
            .warn("deployer", format!("rolling back cell {}", decl.cell_id));
        for handle in processes.into_iter().rev() {
            handle.stop().await;
        }
        for instance_id in &instances {
            self.registry.remove_instance(instance_id).await;
        }
        self.record_status(decl, CellStatus::Failed, Vec::new(), Vec::new())
            .await;
    }

    async fn record_status(
        &self,
        decl: &CellDecl,
        status: CellStatus,
        processes: Vec<ProcessHandle>,
        instances: Vec<AgentInstanceId>,
    ) {
        let mut cells = self.cells.lock().await;
        cells.insert(
            decl.cell_id.clone(),
            CellRuntime {
                decl: decl.clone(),
                status,
                processes,
                instances,
            },
        );
    }

    async fn send_drain(&self, instance_id: &AgentInstanceId) {
        if let Some(control) = &self.control {
            let envelope = Envelope::new(SHUTDOWN_KIND, instance_id.to_string(), json!({}));
            if let Err(e) = control.send_to(instance_id.clone(), envelope).await {
                warn!(instance_id = %instance_id, error = %e, "drain message not delivered");
            }
        }
    }
}

async fn publish_cell_event(control: &Option<AgenClient>, kind: &str, cell_id: &CellId) {
    if let Some(control) = control {
        let topic = TopicName::try_new(CONTROL_TOPIC.to_string())
            .unwrap_or_else(|_| unreachable!("constant topic is valid"));
        let envelope = Envelope::new(
            kind,
            format!("pub:{CONTROL_TOPIC}"),
            json!({ "cell_id": cell_id.to_string() }),
        );
        if let Err(e) = control.publish_to(topic, envelope).await {
            warn!(cell_id = %cell_id, kind, error = %e, "cell event not published");
        }
    }
}

/// Splits a cell's agents into dependency layers via repeated leaf removal
fn dependency_layers(decl: &CellDecl) -> Result<Vec<Vec<AgentDecl>>> {
    let mut remaining: Vec<AgentDecl> = decl.agents.clone();
    let mut placed: HashSet<AgentInstanceId> = HashSet::new();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let (ready, rest): (Vec<_>, Vec<_>) = remaining
            .into_iter()
            .partition(|a| a.depends_on.iter().all(|d| placed.contains(d)));
        if ready.is_empty() {
            return Err(DeployError::DependencyCycle {
                cell_id: decl.cell_id.clone(),
            });
        }
        for agent in &ready {
            placed.insert(agent.instance_id.clone());
        }
        if decl.policy.parallel_startup {
            layers.push(ready);
        } else {
            for agent in ready {
                layers.push(vec![agent]);
            }
        }
        remaining = rest;
    }
    Ok(layers)
}

async fn probe_until(endpoint: &str, deadline: tokio::time::Instant) -> bool {
    loop {
        match tokio::net::TcpStream::connect(endpoint).await {
            Ok(_) => return true,
            Err(_) => {
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
