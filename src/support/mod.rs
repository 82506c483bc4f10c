//! Support service: the authoritative catalog of agent types and instances
//!
//! Single source of truth for "what agent types exist", "which instances are
//! live", "where is the broker", and "what is my configuration". A registry
//! outage blocks new registrations but never interrupts established
//! publisher/subscriber sessions; state rebuilds from reconnecting clients.

mod registry;
mod service;
mod types;

pub use registry::{HeartbeatAck, RegistryConfig, RegistryError, SupportRegistry};
pub use service::SupportService;
pub use types::{
    AgentTypeSpec, InstanceFilter, InstanceRecord, InstanceStatus, OperatorMode, ResourceHints,
};
