//! User-facing summaries derived from accumulated request state
//!
//! The completion summary walks successful step results and describes the
//! concrete side effects (files written, files modified, commands run, tests
//! executed) through a fixed action mapping, falling back to a generic
//! phrase only when no side-effect action appears. Failure summaries always
//! report partial progress.

use crate::coordinator::messages::PlanStep;
use crate::coordinator::state::RequestState;

/// Describes the side effects of every successful step, in execution order
pub fn side_effects(state: &RequestState) -> Vec<String> {
    let mut effects = Vec::new();
    for results in &state.results {
        let Some(plan) = state.plan_by_id(&results.plan_id) else {
            continue;
        };
        for result in &results.step_results {
            if !result.success {
                continue;
            }
            let Some(step) = plan.steps.iter().find(|s| s.id == result.step_id) else {
                continue;
            };
            if let Some(effect) = describe_step(step) {
                effects.push(effect);
            }
        }
    }
    effects
}

fn describe_step(step: &PlanStep) -> Option<String> {
    match step.action.as_str() {
        "patch" | "apply_patch" | "edit_file" => {
            Some(format!("modified `{}`", param(step, &["file", "path"])))
        }
        "write_file" | "create_file" => {
            Some(format!("created `{}`", param(step, &["path", "file"])))
        }
        "delete_file" => Some(format!("removed `{}`", param(step, &["path", "file"]))),
        "run_command" | "shell" => Some(format!("ran `{}`", param(step, &["command", "cmd"]))),
        "run_tests" | "test" => Some("executed tests".to_string()),
        _ => None,
    }
}

fn param(step: &PlanStep, keys: &[&str]) -> String {
    for key in keys {
        if let Some(value) = step.params.get(*key) {
            if let Some(s) = value.as_str() {
                return s.to_string();
            }
            return value.to_string();
        }
    }
    "?".to_string()
}

/// Summary for a request that reached its goal
pub fn completion(state: &RequestState) -> String {
    let effects = side_effects(state);
    if effects.is_empty() {
        format!(
            "Goal achieved after {} iteration(s): {}",
            state.iteration, state.request.content
        )
    } else {
        format!(
            "Goal achieved after {} iteration(s): {}",
            state.iteration,
            effects.join("; ")
        )
    }
}

/// Summary for a request that ran out of iterations
pub fn exhaustion(state: &RequestState) -> String {
    let mut parts = vec![format!(
        "goal not achieved after {} iteration(s)",
        state.iteration
    )];
    if let Some(report) = state.reports.last() {
        for issue in &report.issues {
            parts.push(format!("[{}] {}", issue.severity, issue.description));
        }
    }
    let mut summary = parts.join("; ");
    append_progress(state, &mut summary);
    summary
}

/// Summary for timeouts, cancellation, and planner failure
pub fn failure(state: &RequestState, cause: &str) -> String {
    let mut summary = format!("request failed ({cause})");
    append_progress(state, &mut summary);
    summary
}

fn append_progress(state: &RequestState, summary: &mut String) {
    let effects = side_effects(state);
    if !effects.is_empty() {
        summary.push_str("; partial progress: ");
        summary.push_str(&effects.join("; "));
    }
}
