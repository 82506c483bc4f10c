//! Request/reply client for the support service

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{BackoffPolicy, ClientError, Result};
use crate::domain_types::{AgentInstanceId, AgentTypeId};
use crate::protocol::{self, SupportReply, SupportRequest};
use crate::support::{AgentTypeSpec, HeartbeatAck, InstanceFilter, InstanceRecord, InstanceStatus};

/// Client side of the support surface
///
/// One request is in flight at a time; the connection is opened lazily and
/// reopened once per request on I/O failure, since a registry outage only
/// blocks new registrations, never established broker sessions.
pub struct SupportClient {
    endpoint: String,
    stream: Mutex<Option<TcpStream>>,
}

impl SupportClient {
    /// Creates a client for the given `host:port`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            stream: Mutex::new(None),
        }
    }

    /// Registers or replaces an agent type
    pub async fn register_type(&self, spec: AgentTypeSpec) -> Result<()> {
        match self.request(&SupportRequest::RegisterType { spec }).await? {
            SupportReply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Creates an instance record
    pub async fn register_instance(
        &self,
        instance_id: AgentInstanceId,
        type_id: AgentTypeId,
        config: Map<String, Value>,
    ) -> Result<()> {
        let request = SupportRequest::RegisterInstance {
            instance_id,
            type_id,
            config,
        };
        match self.request(&request).await? {
            SupportReply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Reports liveness and status
    pub async fn heartbeat(
        &self,
        instance_id: AgentInstanceId,
        status: InstanceStatus,
    ) -> Result<HeartbeatAck> {
        let request = SupportRequest::Heartbeat {
            instance_id,
            status,
        };
        match self.request(&request).await? {
            SupportReply::Ok => Ok(HeartbeatAck::Recorded),
            SupportReply::ReregisterRequired => Ok(HeartbeatAck::ReregisterRequired),
            other => Err(unexpected(other)),
        }
    }

    /// Fetches the merged configuration for an instance
    pub async fn resolve_config(
        &self,
        instance_id: AgentInstanceId,
    ) -> Result<Map<String, Value>> {
        match self.request(&SupportRequest::ResolveConfig { instance_id }).await? {
            SupportReply::Config { config } => Ok(config),
            other => Err(unexpected(other)),
        }
    }

    /// Asks where the broker is
    pub async fn get_broker_endpoint(&self) -> Result<String> {
        match self.request(&SupportRequest::GetBrokerEndpoint).await? {
            SupportReply::Endpoint { endpoint } => Ok(endpoint),
            other => Err(unexpected(other)),
        }
    }

    /// Polls for the broker endpoint, backing off on `not_ready`
    pub async fn wait_broker_endpoint(&self, deadline: Duration) -> Result<String> {
        let backoff = BackoffPolicy::default();
        let started = tokio::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            match self.get_broker_endpoint().await {
                Ok(endpoint) => return Ok(endpoint),
                Err(ClientError::Support { code, .. }) if code == "not_ready" => {
                    if started.elapsed() >= deadline {
                        return Err(ClientError::Timeout {
                            operation: "get_broker_endpoint".to_string(),
                        });
                    }
                    debug!(attempt, "broker endpoint not ready, retrying");
                    tokio::time::sleep(backoff.delay(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Advertises the broker's address; the broker calls this on startup
    pub async fn set_broker_endpoint(&self, endpoint: String) -> Result<()> {
        match self.request(&SupportRequest::SetBrokerEndpoint { endpoint }).await? {
            SupportReply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Snapshot enumeration of instances
    pub async fn list_instances(&self, filter: InstanceFilter) -> Result<Vec<InstanceRecord>> {
        match self.request(&SupportRequest::ListInstances { filter }).await? {
            SupportReply::Instances { instances } => Ok(instances),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&self, request: &SupportRequest) -> Result<SupportReply> {
        let mut guard = self.stream.lock().await;
        for attempt in 0..2 {
            if guard.is_none() {
                *guard = Some(
                    TcpStream::connect(&self.endpoint)
                        .await
                        .map_err(crate::protocol::ProtocolError::from)?,
                );
            }
            let stream = guard
                .as_mut()
                .unwrap_or_else(|| unreachable!("connected above"));
            let outcome = async {
                protocol::write_frame(stream, request).await?;
                protocol::read_frame::<_, SupportReply>(stream).await
            }
            .await;
            match outcome {
                Ok(SupportReply::Error { code, message }) => {
                    return Err(ClientError::Support { code, message });
                }
                Ok(reply) => return Ok(reply),
                Err(e) if attempt == 0 => {
                    // stale connection from a support restart; dial once more
                    debug!(error = %e, "support request failed, reconnecting");
                    *guard = None;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ClientError::Disconnected)
    }
}

fn unexpected(reply: SupportReply) -> ClientError {
    ClientError::Support {
        code: "unexpected_reply".to_string(),
        message: format!("{reply:?}"),
    }
}
