//! Message contracts of the Plan-Execute-Verify workflow
//!
//! Payload shapes exchanged between the coordinator and its peer agents.
//! The envelope `type` discriminates; payloads decode at the agent boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain_types::RequestId;

/// Envelope kinds used by the workflow
pub mod kinds {
    pub const USER_REQUEST: &str = "user_request";
    pub const PLAN_REQUEST: &str = "plan_request";
    pub const EXECUTION_PLAN: &str = "execution_plan";
    pub const PLAN_ERROR: &str = "plan_error";
    pub const EXECUTE_TASK: &str = "execute_task";
    pub const EXECUTION_RESULTS: &str = "execution_results";
    pub const VERIFY_REQUEST: &str = "verify_request";
    pub const VERIFICATION_REPORT: &str = "verification_report";
    pub const USER_RESPONSE: &str = "user_response";
}

/// A user's goal entering the workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    pub id: RequestId,
    pub content: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Everything prior iterations produced, handed back to the planner
///
/// Grows monotonically: iteration i+1 sees a superset of what iteration i
/// saw. The planner incorporates it; the coordinator never mutates plans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorContext {
    #[serde(default)]
    pub plans: Vec<Vec<PlanStep>>,
    #[serde(default)]
    pub results: Vec<Vec<StepResult>>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub next_actions: Vec<NextAction>,
}

/// Ask the planner for a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub request_id: RequestId,
    pub content: String,
    #[serde(default)]
    pub prior_context: PriorContext,
}

/// One step of an execution plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub phase: String,
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// The planner's answer; immutable once emitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub request_id: RequestId,
    pub goal: String,
    pub steps: Vec<PlanStep>,
}

/// Planner-side failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanError {
    pub request_id: RequestId,
    pub error: String,
}

/// Dispatch of a plan to the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTask {
    pub request_id: RequestId,
    pub plan_id: String,
    pub steps: Vec<PlanStep>,
}

/// Outcome of one executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The executor's answer for a whole plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResults {
    pub request_id: RequestId,
    pub plan_id: String,
    pub step_results: Vec<StepResult>,
    pub all_success: bool,
}

/// Ask the verifier whether the goal was reached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub request_id: RequestId,
    pub plan_id: String,
    pub original_content: String,
    pub step_results: Vec<StepResult>,
}

/// How bad an issue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(tag)
    }
}

/// A problem the verifier found
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub description: String,
    pub severity: IssueSeverity,
}

/// A follow-up the verifier suggests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub priority: String,
}

/// The verifier's answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub id: String,
    pub request_id: RequestId,
    pub goal_achieved: bool,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub next_actions: Vec<NextAction>,
}

/// Terminal outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed,
    Failed,
}

/// The single terminal message every request ends with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub request_id: RequestId,
    pub status: RequestOutcome,
    pub goal_achieved: bool,
    pub iterations: u32,
    pub summary: String,
}
