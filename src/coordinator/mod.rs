//! Plan-Execute-Verify coordination
//!
//! The generalizable shape of a stateful multi-agent workflow: a
//! request-scoped state machine that drives planner, executor, and verifier
//! peers through bounded iterations, accumulating context for re-plans and
//! emitting exactly one terminal response per request.

pub mod messages;
mod pev;
mod state;
pub mod summary;

pub use messages::{
    ExecuteTask, ExecutionPlan, ExecutionResults, Issue, IssueSeverity, NextAction, PlanError,
    PlanRequest, PlanStep, PriorContext, RequestOutcome, StepResult, UserRequest, UserResponse,
    VerificationReport, VerifyRequest, kinds,
};
pub use pev::{Outbox, PevBehavior, PevConfig, PevCoordinator, PevTopics};
pub use state::{Phase, RequestState};
