//! Plan-Execute-Verify coordination scenarios
//!
//! Scripted peers drive the coordinator through single-iteration success,
//! re-planning, iteration exhaustion, phase timeouts, and stale-message
//! handling; a final test runs the whole workflow over a live broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agen::broker::{BrokerConfig, MessageBroker};
use agen::client::{AgenClient, AgentBehavior, AgentContext, ClientConfig, ClientError};
use agen::coordinator::{
    ExecuteTask, Outbox, PevBehavior, PevConfig, PevCoordinator, PlanRequest, RequestOutcome,
    UserResponse, VerifyRequest, kinds,
};
use agen::domain_types::{AgentInstanceId, MaxIterations, ProjectId, RequestId, TopicName};
use agen::protocol::{Envelope, PublishStatus};

struct RecordingOutbox {
    tx: mpsc::UnboundedSender<(String, Envelope)>,
}

#[async_trait]
impl Outbox for RecordingOutbox {
    async fn publish(
        &self,
        topic: &TopicName,
        envelope: Envelope,
    ) -> Result<PublishStatus, ClientError> {
        let _ = self.tx.send((topic.to_string(), envelope));
        Ok(PublishStatus::DeliveredTo { count: 1 })
    }
}

fn coordinator_with(
    config: PevConfig,
) -> (PevCoordinator, mpsc::UnboundedReceiver<(String, Envelope)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = PevCoordinator::new(Arc::new(RecordingOutbox { tx }), config);
    (coordinator, rx)
}

async fn next_emission(
    rx: &mut mpsc::UnboundedReceiver<(String, Envelope)>,
) -> (String, Envelope) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("coordinator should emit")
        .expect("outbox open")
}

fn user_request(id: &str, content: &str) -> Envelope {
    Envelope::new(
        kinds::USER_REQUEST,
        "pub:pev.request",
        json!({ "id": id, "content": content, "context": {} }),
    )
}

fn plan(request_id: &str, plan_id: &str, steps: Value) -> Envelope {
    Envelope::new(
        kinds::EXECUTION_PLAN,
        "pub:pev.plan.result",
        json!({ "id": plan_id, "request_id": request_id, "goal": "goal", "steps": steps }),
    )
}

fn results(request_id: &str, plan_id: &str, step_results: Value, all_success: bool) -> Envelope {
    Envelope::new(
        kinds::EXECUTION_RESULTS,
        "pub:pev.execute.result",
        json!({
            "request_id": request_id,
            "plan_id": plan_id,
            "step_results": step_results,
            "all_success": all_success,
        }),
    )
}

fn report(request_id: &str, report_id: &str, achieved: bool, issues: Value) -> Envelope {
    Envelope::new(
        kinds::VERIFICATION_REPORT,
        "pub:pev.verify.result",
        json!({
            "id": report_id,
            "request_id": request_id,
            "goal_achieved": achieved,
            "issues": issues,
            "next_actions": [],
        }),
    )
}

fn decode_response(envelope: &Envelope) -> UserResponse {
    serde_json::from_value(envelope.payload.clone()).unwrap()
}

#[tokio::test]
async fn test_happy_path_single_iteration() {
    let (coordinator, mut rx) = coordinator_with(PevConfig::default());

    coordinator
        .dispatch(user_request("r1", "add a warning icon"))
        .await;

    let (topic, envelope) = next_emission(&mut rx).await;
    assert_eq!(topic, "pev.plan.request");
    assert_eq!(envelope.kind, kinds::PLAN_REQUEST);

    coordinator
        .dispatch(plan(
            "r1",
            "p1",
            json!([
                { "id": "s1", "phase": "discover", "action": "search", "params": { "query": "icon" } },
                { "id": "s2", "phase": "discover", "action": "read_file", "params": { "file": "src/ui/toolbar.rs" } },
                { "id": "s3", "phase": "apply", "action": "patch", "params": { "file": "src/ui/toolbar.rs" } },
                { "id": "s4", "phase": "check", "action": "run_tests", "params": {} },
            ]),
        ))
        .await;

    let (topic, envelope) = next_emission(&mut rx).await;
    assert_eq!(topic, "pev.execute.request");
    let task: ExecuteTask = serde_json::from_value(envelope.payload).unwrap();
    assert_eq!(task.plan_id, "p1");
    assert_eq!(task.steps.len(), 4);

    coordinator
        .dispatch(results(
            "r1",
            "p1",
            json!([
                { "step_id": "s1", "success": true, "output": null },
                { "step_id": "s2", "success": true, "output": null },
                { "step_id": "s3", "success": true, "output": null },
                { "step_id": "s4", "success": true, "output": null },
            ]),
            true,
        ))
        .await;

    let (topic, envelope) = next_emission(&mut rx).await;
    assert_eq!(topic, "pev.verify.request");
    let verify: VerifyRequest = serde_json::from_value(envelope.payload).unwrap();
    assert_eq!(verify.original_content, "add a warning icon");
    assert_eq!(verify.step_results.len(), 4);

    coordinator.dispatch(report("r1", "v1", true, json!([]))).await;

    let (topic, envelope) = next_emission(&mut rx).await;
    assert_eq!(topic, "pev.response");
    let response = decode_response(&envelope);
    assert_eq!(response.request_id, RequestId::try_new("r1".to_string()).unwrap());
    assert_eq!(response.iterations, 1);
    assert!(response.goal_achieved);
    assert!(response.summary.contains("modified"));
    assert!(response.summary.contains("src/ui/toolbar.rs"));
}

#[tokio::test]
async fn test_replans_until_verifier_is_satisfied() {
    let (coordinator, mut rx) = coordinator_with(PevConfig::default());
    coordinator
        .dispatch(user_request("r2", "fix compilation error"))
        .await;

    for iteration in 1..=3u32 {
        let (topic, envelope) = next_emission(&mut rx).await;
        assert_eq!(topic, "pev.plan.request");
        let request: PlanRequest = serde_json::from_value(envelope.payload).unwrap();
        // context accumulated so far is a superset of every prior iteration
        assert_eq!(request.prior_context.plans.len(), (iteration - 1) as usize);
        assert_eq!(request.prior_context.issues.len(), (iteration - 1) as usize);

        let plan_id = format!("p{iteration}");
        coordinator
            .dispatch(plan(
                "r2",
                &plan_id,
                json!([
                    { "id": format!("{plan_id}-fix"), "phase": "apply", "action": "patch", "params": { "file": "src/lib.rs" } },
                    { "id": format!("{plan_id}-test"), "phase": "check", "action": "run_tests", "params": {} },
                ]),
            ))
            .await;
        let _execute = next_emission(&mut rx).await;

        let succeeded = iteration == 3;
        coordinator
            .dispatch(results(
                "r2",
                &plan_id,
                json!([
                    { "step_id": format!("{plan_id}-fix"), "success": true, "output": null },
                    { "step_id": format!("{plan_id}-test"), "success": succeeded, "output": null },
                ]),
                succeeded,
            ))
            .await;
        let _verify = next_emission(&mut rx).await;

        coordinator
            .dispatch(report(
                "r2",
                &format!("v{iteration}"),
                succeeded,
                if succeeded {
                    json!([])
                } else {
                    json!([{ "step_id": format!("{plan_id}-test"), "description": "tests still failing", "severity": "critical" }])
                },
            ))
            .await;
    }

    let (topic, envelope) = next_emission(&mut rx).await;
    assert_eq!(topic, "pev.response");
    let response = decode_response(&envelope);
    assert_eq!(response.iterations, 3);
    assert!(response.goal_achieved);
    assert_eq!(response.status, RequestOutcome::Completed);
}

#[tokio::test]
async fn test_iteration_exhaustion_fails_with_last_issues() {
    let config = PevConfig {
        max_iterations: MaxIterations::try_new(3).unwrap(),
        ..PevConfig::default()
    };
    let (coordinator, mut rx) = coordinator_with(config);
    coordinator
        .dispatch(user_request("r_max", "fix compilation error"))
        .await;

    for iteration in 1..=3u32 {
        let (topic, _) = next_emission(&mut rx).await;
        assert_eq!(topic, "pev.plan.request");

        let plan_id = format!("p{iteration}");
        coordinator
            .dispatch(plan(
                "r_max",
                &plan_id,
                json!([{ "id": format!("{plan_id}-s"), "phase": "check", "action": "run_tests", "params": {} }]),
            ))
            .await;
        let _execute = next_emission(&mut rx).await;
        coordinator
            .dispatch(results(
                "r_max",
                &plan_id,
                json!([{ "step_id": format!("{plan_id}-s"), "success": false, "output": null, "error": "E0308" }]),
                false,
            ))
            .await;
        let _verify = next_emission(&mut rx).await;
        coordinator
            .dispatch(report(
                "r_max",
                &format!("v{iteration}"),
                false,
                json!([{ "description": "compilation still failing", "severity": "critical" }]),
            ))
            .await;
    }

    let (topic, envelope) = next_emission(&mut rx).await;
    assert_eq!(topic, "pev.response");
    let response = decode_response(&envelope);
    assert!(!response.goal_achieved);
    assert_eq!(response.iterations, 3);
    assert_eq!(response.status, RequestOutcome::Failed);
    assert!(response.summary.contains("compilation still failing"));
    assert!(response.summary.contains("[critical]"));
}

#[tokio::test]
async fn test_planning_deadline_expires_into_failure() {
    let config = PevConfig {
        planning_deadline: Duration::from_millis(100),
        ..PevConfig::default()
    };
    let (coordinator, mut rx) = coordinator_with(config);
    coordinator.dispatch(user_request("r_slow", "anything")).await;

    let (topic, _) = next_emission(&mut rx).await;
    assert_eq!(topic, "pev.plan.request");

    // no planner answers
    let (topic, envelope) = next_emission(&mut rx).await;
    assert_eq!(topic, "pev.response");
    let response = decode_response(&envelope);
    assert!(!response.goal_achieved);
    assert!(response.summary.contains("phase_timeout:planning"));
}

#[tokio::test]
async fn test_terminal_and_unknown_request_ids_are_dropped() {
    let config = PevConfig {
        planning_deadline: Duration::from_millis(100),
        ..PevConfig::default()
    };
    let (coordinator, mut rx) = coordinator_with(config);

    // unknown id: nothing happens
    coordinator
        .dispatch(plan("r_ghost", "p1", json!([])))
        .await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );

    // drive a request to terminal via timeout
    coordinator.dispatch(user_request("r_done", "anything")).await;
    let _plan_request = next_emission(&mut rx).await;
    let (topic, _) = next_emission(&mut rx).await;
    assert_eq!(topic, "pev.response");

    // terminal id: duplicate request and late messages are dropped
    coordinator.dispatch(user_request("r_done", "again")).await;
    coordinator.dispatch(plan("r_done", "p9", json!([]))).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );
    assert_eq!(coordinator.open_requests(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_open_requests_to_failed() {
    let (coordinator, mut rx) = coordinator_with(PevConfig::default());
    coordinator.dispatch(user_request("r_open", "anything")).await;
    let _plan_request = next_emission(&mut rx).await;

    coordinator.shutdown().await;

    let (topic, envelope) = next_emission(&mut rx).await;
    assert_eq!(topic, "pev.response");
    let response = decode_response(&envelope);
    assert!(!response.goal_achieved);
    assert!(response.summary.contains("cancelled"));
}

// --- full workflow over a live broker ---

struct PlannerStub;

#[async_trait]
impl AgentBehavior for PlannerStub {
    async fn handle_message(&self, envelope: Envelope) -> Result<Option<Envelope>, ClientError> {
        let request: PlanRequest = serde_json::from_value(envelope.payload)
            .map_err(|e| ClientError::Handler(e.to_string()))?;
        Ok(Some(Envelope::new(
            kinds::EXECUTION_PLAN,
            "pub:pev.plan.result",
            json!({
                "id": "p1",
                "request_id": request.request_id,
                "goal": request.content,
                "steps": [
                    { "id": "s1", "phase": "apply", "action": "patch", "params": { "file": "src/ui/toolbar.rs" } },
                    { "id": "s2", "phase": "check", "action": "run_tests", "params": {} },
                ],
            }),
        )))
    }
}

struct ExecutorStub;

#[async_trait]
impl AgentBehavior for ExecutorStub {
    async fn handle_message(&self, envelope: Envelope) -> Result<Option<Envelope>, ClientError> {
        let task: ExecuteTask = serde_json::from_value(envelope.payload)
            .map_err(|e| ClientError::Handler(e.to_string()))?;
        let step_results: Vec<Value> = task
            .steps
            .iter()
            .map(|s| json!({ "step_id": s.id, "success": true, "output": null }))
            .collect();
        Ok(Some(Envelope::new(
            kinds::EXECUTION_RESULTS,
            "pub:pev.execute.result",
            json!({
                "request_id": task.request_id,
                "plan_id": task.plan_id,
                "step_results": step_results,
                "all_success": true,
            }),
        )))
    }
}

struct VerifierStub;

#[async_trait]
impl AgentBehavior for VerifierStub {
    async fn handle_message(&self, envelope: Envelope) -> Result<Option<Envelope>, ClientError> {
        let request: VerifyRequest = serde_json::from_value(envelope.payload)
            .map_err(|e| ClientError::Handler(e.to_string()))?;
        Ok(Some(Envelope::new(
            kinds::VERIFICATION_REPORT,
            "pub:pev.verify.result",
            json!({
                "id": "v1",
                "request_id": request.request_id,
                "goal_achieved": true,
                "issues": [],
                "next_actions": [],
            }),
        )))
    }
}

async fn peer(
    broker: &MessageBroker,
    id: &str,
    ingress: &str,
    behavior: Arc<dyn AgentBehavior>,
) -> tokio::task::JoinHandle<()> {
    let client = AgenClient::connect(ClientConfig::new(
        broker.local_addr().to_string(),
        AgentInstanceId::try_new(id.to_string()).unwrap(),
        ProjectId::try_new("test".to_string()).unwrap(),
    ))
    .await
    .unwrap();
    client
        .subscribe(TopicName::try_new(ingress.to_string()).unwrap())
        .await
        .unwrap();
    let ctx = AgentContext {
        agent_id: AgentInstanceId::try_new(id.to_string()).unwrap(),
        project_id: ProjectId::try_new("test".to_string()).unwrap(),
        data_root: None,
        config: Map::new(),
    };
    tokio::spawn(async move {
        let _ = client.run(behavior, ctx).await;
    })
}

#[tokio::test]
async fn test_full_workflow_over_live_broker() {
    let broker = MessageBroker::start(
        BrokerConfig::default(),
        None,
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let _planner = peer(&broker, "planner-1", "pev.plan.request", Arc::new(PlannerStub)).await;
    let _executor = peer(
        &broker,
        "executor-1",
        "pev.execute.request",
        Arc::new(ExecutorStub),
    )
    .await;
    let _verifier = peer(
        &broker,
        "verifier-1",
        "pev.verify.request",
        Arc::new(VerifierStub),
    )
    .await;

    // the coordinator itself runs behind the client library
    let pev_client = AgenClient::connect(ClientConfig::new(
        broker.local_addr().to_string(),
        AgentInstanceId::try_new("pev-1".to_string()).unwrap(),
        ProjectId::try_new("test".to_string()).unwrap(),
    ))
    .await
    .unwrap();
    let coordinator = PevCoordinator::new(Arc::new(pev_client.clone()), PevConfig::default());
    for topic in coordinator.ingress_topics() {
        pev_client.subscribe(topic).await.unwrap();
    }
    let pev_ctx = AgentContext {
        agent_id: AgentInstanceId::try_new("pev-1".to_string()).unwrap(),
        project_id: ProjectId::try_new("test".to_string()).unwrap(),
        data_root: None,
        config: Map::new(),
    };
    let behavior = Arc::new(PevBehavior::new(coordinator));
    let pev_run = pev_client.clone();
    tokio::spawn(async move {
        let _ = pev_run.run(behavior, pev_ctx).await;
    });

    // a user submits a goal and waits on the response topic
    let user = AgenClient::connect(ClientConfig::new(
        broker.local_addr().to_string(),
        AgentInstanceId::try_new("user-1".to_string()).unwrap(),
        ProjectId::try_new("test".to_string()).unwrap(),
    ))
    .await
    .unwrap();
    user.subscribe(TopicName::try_new("pev.response".to_string()).unwrap())
        .await
        .unwrap();
    let mut responses = user.deliveries().await.unwrap();

    user.publish_to(
        TopicName::try_new("pev.request".to_string()).unwrap(),
        user_request("r_e2e", "add a warning icon"),
    )
    .await
    .unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(10), responses.recv())
        .await
        .expect("workflow should complete")
        .expect("stream open");
    assert_eq!(envelope.kind, kinds::USER_RESPONSE);
    let response = decode_response(&envelope);
    assert_eq!(
        response.request_id,
        RequestId::try_new("r_e2e".to_string()).unwrap()
    );
    assert!(response.goal_achieved);
    assert_eq!(response.iterations, 1);
    assert!(response.summary.contains("modified `src/ui/toolbar.rs`"));
}
