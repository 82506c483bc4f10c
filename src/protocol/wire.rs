//! Handshake and frame types for the broker and support endpoints

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain_types::{AgentInstanceId, AgentTypeId, ProjectId};
use crate::protocol::Envelope;
use crate::support::{AgentTypeSpec, InstanceFilter, InstanceRecord, InstanceStatus};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Codec identifier for the default self-describing text codec
pub const CODEC_JSON: &str = "json";

/// First frame on every broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub agent_id: AgentInstanceId,
    pub project_id: ProjectId,
    pub codec: String,
    pub protocol_version: u32,
}

/// Broker answer to a [`Hello`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HandshakeReply {
    Welcome { heartbeat_interval_ms: u64 },
    Reject { reason: String },
}

/// Frames an agent sends to the broker after the handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { seq: u64, topic: String, envelope: Envelope },
    Send { seq: u64, target: String, envelope: Envelope },
    Drain,
}

/// Frames the broker sends to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerFrame {
    SubscribeAck { topic: String },
    UnsubscribeAck { topic: String },
    PublishAck { seq: u64, status: PublishStatus },
    SendAck { seq: u64, status: SendStatus },
    Deliver { envelope: Envelope },
}

/// Aggregate outcome of a publish, as observed by the publisher
///
/// Partial delivery is never reported as success: if any current subscriber
/// could not be enqueued, the whole publish reports an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PublishStatus {
    DeliveredTo { count: usize },
    NoSubscribers,
    Error { code: String },
}

/// Outcome of a direct send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SendStatus {
    Delivered,
    NoSuchTarget,
    Error { code: String },
}

/// Request/reply surface of the support service, over the same framing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SupportRequest {
    RegisterType {
        spec: AgentTypeSpec,
    },
    RegisterInstance {
        instance_id: AgentInstanceId,
        type_id: AgentTypeId,
        #[serde(default)]
        config: Map<String, Value>,
    },
    Heartbeat {
        instance_id: AgentInstanceId,
        status: InstanceStatus,
    },
    ResolveConfig {
        instance_id: AgentInstanceId,
    },
    GetBrokerEndpoint,
    SetBrokerEndpoint {
        endpoint: String,
    },
    ListInstances {
        #[serde(default)]
        filter: InstanceFilter,
    },
}

/// Support service replies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SupportReply {
    Ok,
    ReregisterRequired,
    Config { config: Map<String, Value> },
    Endpoint { endpoint: String },
    Instances { instances: Vec<InstanceRecord> },
    Error { code: String, message: String },
}
