//! Bootstrap for spawned agent processes
//!
//! Reads the injected environment, registers with the support service,
//! resolves configuration, locates the broker, connects, and keeps the
//! heartbeat loop alive until the agent drains.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::support::SupportClient;
use crate::client::{AgenClient, AgentBehavior, AgentContext, ClientConfig, ClientError, Result};
use crate::domain_types::{AgentInstanceId, AgentTypeId, ProjectId};
use crate::support::{HeartbeatAck, InstanceStatus};

/// Environment variables injected into every spawned agent
pub const ENV_SUPPORT_ENDPOINT: &str = "AGEN_SUPPORT_ENDPOINT";
pub const ENV_AGENT_ID: &str = "AGEN_AGENT_ID";
pub const ENV_AGENT_TYPE: &str = "AGEN_AGENT_TYPE";
pub const ENV_PROJECT_ID: &str = "AGEN_PROJECT_ID";
pub const ENV_DATA_ROOT: &str = "AGEN_DATA_ROOT";
pub const ENV_SESSION_LOG: &str = "AGEN_SESSION_LOG";
pub const ENV_CONFIG_OVERRIDES: &str = "AGEN_CONFIG";

/// A bootstrapped agent process: support session, broker session, heartbeats
pub struct AgentRuntime {
    client: AgenClient,
    support: Arc<SupportClient>,
    ctx: AgentContext,
    cancel: CancellationToken,
    heartbeat_task: JoinHandle<()>,
}

impl AgentRuntime {
    /// Bootstraps from the injected environment
    ///
    /// # Errors
    ///
    /// Fails when required environment variables are missing, registration
    /// is refused, or the broker cannot be reached.
    pub async fn from_env() -> Result<Self> {
        let agent_id = required_env(ENV_AGENT_ID)?;
        let agent_id = AgentInstanceId::try_new(agent_id.clone())
            .map_err(|_| invalid("agent id", agent_id))?;
        let type_id = required_env(ENV_AGENT_TYPE)?;
        let type_id =
            AgentTypeId::try_new(type_id.clone()).map_err(|_| invalid("agent type", type_id))?;
        let project_id = required_env(ENV_PROJECT_ID)?;
        let project_id = ProjectId::try_new(project_id.clone())
            .map_err(|_| invalid("project id", project_id))?;
        let support_endpoint = required_env(ENV_SUPPORT_ENDPOINT)?;
        let data_root = std::env::var(ENV_DATA_ROOT).ok().map(PathBuf::from);
        let overrides: Map<String, Value> = match std::env::var(ENV_CONFIG_OVERRIDES) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|_| invalid("config overrides", raw))?,
            Err(_) => Map::new(),
        };

        Self::bootstrap(agent_id, type_id, project_id, support_endpoint, data_root, overrides)
            .await
    }

    /// Bootstraps with explicit parameters; `from_env` delegates here
    pub async fn bootstrap(
        agent_id: AgentInstanceId,
        type_id: AgentTypeId,
        project_id: ProjectId,
        support_endpoint: String,
        data_root: Option<PathBuf>,
        overrides: Map<String, Value>,
    ) -> Result<Self> {
        let support = Arc::new(SupportClient::new(support_endpoint));
        support
            .register_instance(agent_id.clone(), type_id.clone(), overrides.clone())
            .await?;
        let config = support.resolve_config(agent_id.clone()).await?;
        let broker_endpoint = support
            .wait_broker_endpoint(Duration::from_secs(30))
            .await?;

        // the deployer renders ingress/egress expressions into the overrides
        let egress = config
            .get("egress")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut client_config =
            ClientConfig::new(broker_endpoint, agent_id.clone(), project_id.clone());
        client_config.egress = egress;
        let client = AgenClient::connect(client_config).await?;

        let cancel = CancellationToken::new();
        let heartbeat_task = spawn_heartbeat(
            support.clone(),
            agent_id.clone(),
            type_id,
            overrides,
            Duration::from_secs(5),
            cancel.clone(),
        );

        let ctx = AgentContext {
            agent_id,
            project_id,
            data_root,
            config,
        };
        Ok(Self {
            client,
            support,
            ctx,
            cancel,
            heartbeat_task,
        })
    }

    /// The broker client
    pub fn client(&self) -> &AgenClient {
        &self.client
    }

    /// The support client
    pub fn support(&self) -> &SupportClient {
        &self.support
    }

    /// The resolved execution context
    pub fn ctx(&self) -> &AgentContext {
        &self.ctx
    }

    /// Topics named by the resolved `ingress` expression, if any
    pub fn ingress_topics(&self) -> Vec<crate::domain_types::TopicName> {
        let Some(expression) = self.ctx.config.get("ingress").and_then(Value::as_str) else {
            return Vec::new();
        };
        match crate::protocol::Target::parse(expression) {
            Ok(crate::protocol::Target::Subscribe(topic)) => vec![topic],
            Ok(other) => {
                warn!(expression, target = ?other, "ingress expression is not a subscription");
                Vec::new()
            }
            Err(e) => {
                warn!(expression, error = %e, "malformed ingress expression");
                Vec::new()
            }
        }
    }

    /// Subscribes to each ingress topic, then runs the behavior to drain
    pub async fn serve(
        self,
        ingress: Vec<crate::domain_types::TopicName>,
        behavior: Arc<dyn AgentBehavior>,
    ) -> Result<()> {
        for topic in ingress {
            self.client.subscribe(topic).await?;
        }
        let _ = self
            .support
            .heartbeat(self.ctx.agent_id.clone(), InstanceStatus::Ready)
            .await;
        let result = self.client.run(behavior, self.ctx.clone()).await;
        self.cancel.cancel();
        let _ = self
            .support
            .heartbeat(self.ctx.agent_id.clone(), InstanceStatus::Stopped)
            .await;
        self.heartbeat_task.abort();
        result
    }
}

fn spawn_heartbeat(
    support: Arc<SupportClient>,
    agent_id: AgentInstanceId,
    type_id: AgentTypeId,
    overrides: Map<String, Value>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match support.heartbeat(agent_id.clone(), InstanceStatus::Running).await {
                        Ok(HeartbeatAck::Recorded) => {}
                        Ok(HeartbeatAck::ReregisterRequired) => {
                            // Registry restarted: rebuild our record so its
                            // state converges within the rebuild window.
                            debug!(agent_id = %agent_id, "re-registering after registry restart");
                            if let Err(e) = support
                                .register_instance(agent_id.clone(), type_id.clone(), overrides.clone())
                                .await
                            {
                                warn!(agent_id = %agent_id, error = %e, "re-registration failed");
                            }
                        }
                        Err(e) => warn!(agent_id = %agent_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        }
    })
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| ClientError::MissingEnv {
        name: name.to_string(),
    })
}

fn invalid(what: &str, value: String) -> ClientError {
    ClientError::InvalidValue {
        what: what.to_string(),
        value,
    }
}
