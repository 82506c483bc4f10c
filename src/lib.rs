//! # Agen - Agent Orchestration Core
//!
//! Independently deployed worker processes ("agents") cooperate through a
//! central message broker to execute multi-stage pipelines ("cells"). This
//! crate is the orchestration core: the support registry that catalogs
//! agent types and live instances, the pub/sub broker with per-publisher
//! ordering and back-pressure, the deployer that ties process lifetimes to
//! cells, and the Plan-Execute-Verify coordinator that drives iterative
//! goal-seeking workflows across planner, executor, and verifier agents.
//!
//! Domain agents live outside this crate; they embed [`client`] and
//! implement [`client::AgentBehavior`].

pub mod broker;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod deployer;
pub mod domain_types;
pub mod error;
pub mod protocol;
pub mod session_log;
pub mod support;

pub use broker::{BrokerConfig, MessageBroker};
pub use client::{AgenClient, AgentBehavior, AgentContext, AgentRuntime, ClientConfig, SupportClient};
pub use config::OrchestratorConfig;
pub use coordinator::{PevConfig, PevCoordinator};
pub use deployer::AgentDeployer;
pub use domain_types::{
    AgentInstanceId, AgentTypeId, CellId, MessageId, ProjectId, RequestId, TopicName,
};
pub use error::OrchestratorError;
pub use protocol::{Envelope, Target};
pub use session_log::SessionLog;
pub use support::{SupportRegistry, SupportService};
