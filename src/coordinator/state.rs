//! Request-scoped state record
//!
//! One record per request id, owned by exactly one handling task at a time.
//! Accumulated context only ever grows, which is what makes re-plan context
//! monotonic across iterations.

use crate::coordinator::messages::{
    ExecutionPlan, ExecutionResults, PriorContext, UserRequest, VerificationReport,
};

/// Phase of a request's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Received,
    Planning,
    Executing,
    Verifying,
    Completed,
    Failed,
}

impl Phase {
    /// Wire/lore name of the phase, used in timeout causes
    pub fn name(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the request has reached a terminal phase
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Everything the coordinator holds for one request
#[derive(Debug)]
pub struct RequestState {
    pub request: UserRequest,
    pub phase: Phase,
    pub iteration: u32,
    pub plans: Vec<ExecutionPlan>,
    pub results: Vec<ExecutionResults>,
    pub reports: Vec<VerificationReport>,
}

impl RequestState {
    /// Fresh state for a newly received request
    pub fn new(request: UserRequest) -> Self {
        Self {
            request,
            phase: Phase::Received,
            iteration: 0,
            plans: Vec::new(),
            results: Vec::new(),
            reports: Vec::new(),
        }
    }

    /// Snapshot of all accumulated context for the next plan request
    pub fn prior_context(&self) -> PriorContext {
        PriorContext {
            plans: self.plans.iter().map(|p| p.steps.clone()).collect(),
            results: self
                .results
                .iter()
                .map(|r| r.step_results.clone())
                .collect(),
            issues: self
                .reports
                .iter()
                .flat_map(|r| r.issues.iter().cloned())
                .collect(),
            next_actions: self
                .reports
                .iter()
                .flat_map(|r| r.next_actions.iter().cloned())
                .collect(),
        }
    }

    /// The plan a set of results belongs to
    pub fn plan_by_id(&self, plan_id: &str) -> Option<&ExecutionPlan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::messages::{Issue, IssueSeverity, PlanStep, StepResult};
    use crate::domain_types::RequestId;
    use serde_json::Map;

    fn request(id: &str) -> UserRequest {
        UserRequest {
            id: RequestId::try_new(id.to_string()).unwrap(),
            content: "do the thing".to_string(),
            context: Map::new(),
        }
    }

    fn plan(id: &str, request_id: &str) -> ExecutionPlan {
        ExecutionPlan {
            id: id.to_string(),
            request_id: RequestId::try_new(request_id.to_string()).unwrap(),
            goal: "goal".to_string(),
            steps: vec![PlanStep {
                id: format!("{id}-s1"),
                phase: "exec".to_string(),
                action: "run_command".to_string(),
                params: Map::new(),
            }],
        }
    }

    #[test]
    fn test_prior_context_grows_monotonically() {
        let mut state = RequestState::new(request("r1"));

        state.plans.push(plan("p1", "r1"));
        state.results.push(ExecutionResults {
            request_id: state.request.id.clone(),
            plan_id: "p1".to_string(),
            step_results: vec![StepResult {
                step_id: "p1-s1".to_string(),
                success: false,
                output: serde_json::Value::Null,
                error: Some("boom".to_string()),
            }],
            all_success: false,
        });
        state.reports.push(VerificationReport {
            id: "v1".to_string(),
            request_id: state.request.id.clone(),
            goal_achieved: false,
            issues: vec![Issue {
                step_id: Some("p1-s1".to_string()),
                description: "command failed".to_string(),
                severity: IssueSeverity::High,
            }],
            next_actions: Vec::new(),
        });
        let first = state.prior_context();

        state.plans.push(plan("p2", "r1"));
        let second = state.prior_context();

        assert_eq!(first.plans.len(), 1);
        assert_eq!(second.plans.len(), 2);
        assert_eq!(second.plans[0], first.plans[0]);
        assert_eq!(second.issues.len(), first.issues.len());
    }
}
