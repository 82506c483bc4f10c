//! The Plan-Execute-Verify coordinator
//!
//! Request states are partitioned by request id; every inbound envelope is
//! routed to its partition's handling task, so each record has a single
//! owner and per-request phase ordering is total. The iteration bound is
//! enforced here regardless of how optimistic downstream agents are, and
//! every request emits exactly one terminal user response.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::client::{AgenClient, AgentBehavior, AgentContext, ClientError};
use crate::coordinator::messages::{
    ExecuteTask, ExecutionPlan, ExecutionResults, PlanError, PlanRequest, UserRequest,
    UserResponse, VerificationReport, VerifyRequest, kinds,
};
use crate::coordinator::state::{Phase, RequestState};
use crate::coordinator::summary;
use crate::domain_types::{MaxIterations, RequestId, TopicName};
use crate::protocol::{Envelope, PublishStatus};

/// Where the coordinator publishes and what it listens on
#[derive(Debug, Clone)]
pub struct PevTopics {
    pub plan_request: TopicName,
    pub execute_task: TopicName,
    pub verify_request: TopicName,
    pub response: TopicName,
    /// Topics the coordinator subscribes to
    pub ingress: Vec<TopicName>,
}

fn topic(name: &str) -> TopicName {
    TopicName::try_new(name.to_string()).unwrap_or_else(|_| unreachable!("constant topic is valid"))
}

impl Default for PevTopics {
    fn default() -> Self {
        Self {
            plan_request: topic("pev.plan.request"),
            execute_task: topic("pev.execute.request"),
            verify_request: topic("pev.verify.request"),
            response: topic("pev.response"),
            ingress: vec![
                topic("pev.request"),
                topic("pev.plan.result"),
                topic("pev.execute.result"),
                topic("pev.verify.result"),
            ],
        }
    }
}

/// Coordinator policy
#[derive(Debug, Clone)]
pub struct PevConfig {
    pub max_iterations: MaxIterations,
    pub planning_deadline: Duration,
    pub executing_deadline: Duration,
    pub verifying_deadline: Duration,
    /// How long terminal state lingers before garbage collection
    pub request_gc_grace: Duration,
    pub topics: PevTopics,
}

impl Default for PevConfig {
    fn default() -> Self {
        Self {
            max_iterations: MaxIterations::try_new(3)
                .unwrap_or_else(|_| unreachable!("3 is within bounds")),
            planning_deadline: Duration::from_secs(60),
            executing_deadline: Duration::from_secs(300),
            verifying_deadline: Duration::from_secs(60),
            request_gc_grace: Duration::from_secs(60),
            topics: PevTopics::default(),
        }
    }
}

/// Where coordinator emissions go; implemented by the broker client and by
/// test doubles
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Publishes one envelope to a topic
    async fn publish(
        &self,
        topic: &TopicName,
        envelope: Envelope,
    ) -> Result<PublishStatus, ClientError>;
}

#[async_trait]
impl Outbox for AgenClient {
    async fn publish(
        &self,
        topic: &TopicName,
        envelope: Envelope,
    ) -> Result<PublishStatus, ClientError> {
        self.publish_to(topic.clone(), envelope).await
    }
}

enum Inbound {
    Plan(ExecutionPlan),
    PlanFailed(PlanError),
    Results(ExecutionResults),
    Report(VerificationReport),
}

impl Inbound {
    fn describe(&self) -> &'static str {
        match self {
            Self::Plan(_) => kinds::EXECUTION_PLAN,
            Self::PlanFailed(_) => kinds::PLAN_ERROR,
            Self::Results(_) => kinds::EXECUTION_RESULTS,
            Self::Report(_) => kinds::VERIFICATION_REPORT,
        }
    }
}

enum PartitionEntry {
    Active(mpsc::Sender<Inbound>),
    Terminal,
}

/// The coordinator; cheap to clone, one shared state
#[derive(Clone)]
pub struct PevCoordinator {
    config: Arc<PevConfig>,
    outbox: Arc<dyn Outbox>,
    partitions: Arc<DashMap<RequestId, PartitionEntry>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PevCoordinator {
    /// Creates a coordinator that emits through the given outbox
    pub fn new(outbox: Arc<dyn Outbox>, config: PevConfig) -> Self {
        Self {
            config: Arc::new(config),
            outbox,
            partitions: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Topics the embedding agent should subscribe to
    pub fn ingress_topics(&self) -> Vec<TopicName> {
        self.config.topics.ingress.clone()
    }

    /// Number of requests currently in a non-terminal phase
    pub fn open_requests(&self) -> usize {
        self.partitions
            .iter()
            .filter(|e| matches!(e.value(), PartitionEntry::Active(_)))
            .count()
    }

    /// Routes one inbound envelope to its request partition
    ///
    /// Envelopes for unknown or already-terminal request ids are logged and
    /// dropped; so are payloads that fail to decode.
    pub async fn dispatch(&self, envelope: Envelope) {
        match envelope.kind.as_str() {
            kinds::USER_REQUEST => match self.decode::<UserRequest>(&envelope) {
                Some(request) => self.accept_request(request).await,
                None => {}
            },
            kinds::EXECUTION_PLAN => {
                if let Some(plan) = self.decode::<ExecutionPlan>(&envelope) {
                    self.route(plan.request_id.clone(), Inbound::Plan(plan)).await;
                }
            }
            kinds::PLAN_ERROR => {
                if let Some(error) = self.decode::<PlanError>(&envelope) {
                    self.route(error.request_id.clone(), Inbound::PlanFailed(error))
                        .await;
                }
            }
            kinds::EXECUTION_RESULTS => {
                if let Some(results) = self.decode::<ExecutionResults>(&envelope) {
                    self.route(results.request_id.clone(), Inbound::Results(results))
                        .await;
                }
            }
            kinds::VERIFICATION_REPORT => {
                if let Some(report) = self.decode::<VerificationReport>(&envelope) {
                    self.route(report.request_id.clone(), Inbound::Report(report))
                        .await;
                }
            }
            other => debug!(kind = %other, "unhandled envelope kind"),
        }
    }

    /// Drains every open request into a failed response, then stops
    pub async fn shutdown(&self) {
        info!(open = self.open_requests(), "coordinator shutting down");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, envelope: &Envelope) -> Option<T> {
        match serde_json::from_value(envelope.payload.clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "undecodable payload dropped");
                None
            }
        }
    }

    async fn accept_request(&self, request: UserRequest) {
        let id = request.id.clone();
        let (tx, rx) = mpsc::channel::<Inbound>(16);
        match self.partitions.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                info!(request_id = %id, "duplicate or terminal request id, dropped");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(PartitionEntry::Active(tx));
            }
        }

        let worker = RequestWorker {
            config: self.config.clone(),
            outbox: self.outbox.clone(),
            partitions: self.partitions.clone(),
            cancel: self.cancel.clone(),
        };
        let _ = self
            .tracker
            .spawn(worker.run(RequestState::new(request), rx));
    }

    async fn route(&self, request_id: RequestId, inbound: Inbound) {
        let tx = match self.partitions.get(&request_id) {
            Some(entry) => match entry.value() {
                PartitionEntry::Active(tx) => tx.clone(),
                PartitionEntry::Terminal => {
                    info!(request_id = %request_id, kind = inbound.describe(), "message for terminal request dropped");
                    return;
                }
            },
            None => {
                info!(request_id = %request_id, kind = inbound.describe(), "message for unknown request dropped");
                return;
            }
        };
        if tx.send(inbound).await.is_err() {
            debug!(request_id = %request_id, "partition gone, message dropped");
        }
    }
}

enum Finish {
    Completed,
    Exhausted,
    Failed(String),
}

struct RequestWorker {
    config: Arc<PevConfig>,
    outbox: Arc<dyn Outbox>,
    partitions: Arc<DashMap<RequestId, PartitionEntry>>,
    cancel: CancellationToken,
}

impl RequestWorker {
    async fn run(self, mut state: RequestState, mut rx: mpsc::Receiver<Inbound>) {
        let id = state.request.id.clone();
        info!(request_id = %id, "request received");

        state.phase = Phase::Planning;
        state.iteration = 1;
        self.emit(
            &self.config.topics.plan_request,
            kinds::PLAN_REQUEST,
            &PlanRequest {
                request_id: id.clone(),
                content: state.request.content.clone(),
                prior_context: state.prior_context(),
            },
        )
        .await;

        let finish = loop {
            let deadline = match state.phase {
                Phase::Executing => self.config.executing_deadline,
                Phase::Verifying => self.config.verifying_deadline,
                _ => self.config.planning_deadline,
            };

            let inbound = tokio::select! {
                _ = self.cancel.cancelled() => break Finish::Failed("cancelled".to_string()),
                received = tokio::time::timeout(deadline, rx.recv()) => match received {
                    Err(_) => break Finish::Failed(format!("phase_timeout:{}", state.phase.name())),
                    Ok(None) => return,
                    Ok(Some(inbound)) => inbound,
                },
            };

            match (state.phase, inbound) {
                (Phase::Planning, Inbound::Plan(plan)) => {
                    debug!(request_id = %id, plan_id = %plan.id, steps = plan.steps.len(), "plan received");
                    let task = ExecuteTask {
                        request_id: id.clone(),
                        plan_id: plan.id.clone(),
                        steps: plan.steps.clone(),
                    };
                    state.plans.push(plan);
                    state.phase = Phase::Executing;
                    self.emit(&self.config.topics.execute_task, kinds::EXECUTE_TASK, &task)
                        .await;
                }
                (Phase::Planning, Inbound::PlanFailed(error)) => {
                    break Finish::Failed(format!("plan_error: {}", error.error));
                }
                (Phase::Executing, Inbound::Results(results)) => {
                    debug!(request_id = %id, all_success = results.all_success, "execution results received");
                    // the verifier inspects failed runs too
                    let verify = VerifyRequest {
                        request_id: id.clone(),
                        plan_id: results.plan_id.clone(),
                        original_content: state.request.content.clone(),
                        step_results: results.step_results.clone(),
                    };
                    state.results.push(results);
                    state.phase = Phase::Verifying;
                    self.emit(
                        &self.config.topics.verify_request,
                        kinds::VERIFY_REQUEST,
                        &verify,
                    )
                    .await;
                }
                (Phase::Verifying, Inbound::Report(report)) => {
                    let achieved = report.goal_achieved;
                    debug!(request_id = %id, goal_achieved = achieved, issues = report.issues.len(), "verification report received");
                    state.reports.push(report);
                    if achieved {
                        break Finish::Completed;
                    }
                    if state.iteration < self.config.max_iterations.as_u32() {
                        state.iteration += 1;
                        state.phase = Phase::Planning;
                        self.emit(
                            &self.config.topics.plan_request,
                            kinds::PLAN_REQUEST,
                            &PlanRequest {
                                request_id: id.clone(),
                                content: state.request.content.clone(),
                                prior_context: state.prior_context(),
                            },
                        )
                        .await;
                    } else {
                        break Finish::Exhausted;
                    }
                }
                (_, stale) => {
                    debug!(request_id = %id, phase = state.phase.name(), kind = stale.describe(), "out-of-phase message dropped");
                }
            }
        };

        let response = match finish {
            Finish::Completed => {
                state.phase = Phase::Completed;
                UserResponse {
                    request_id: id.clone(),
                    status: crate::coordinator::messages::RequestOutcome::Completed,
                    goal_achieved: true,
                    iterations: state.iteration,
                    summary: summary::completion(&state),
                }
            }
            Finish::Exhausted => {
                state.phase = Phase::Failed;
                UserResponse {
                    request_id: id.clone(),
                    status: crate::coordinator::messages::RequestOutcome::Failed,
                    goal_achieved: false,
                    iterations: state.iteration,
                    summary: summary::exhaustion(&state),
                }
            }
            Finish::Failed(cause) => {
                state.phase = Phase::Failed;
                UserResponse {
                    request_id: id.clone(),
                    status: crate::coordinator::messages::RequestOutcome::Failed,
                    goal_achieved: false,
                    iterations: state.iteration,
                    summary: summary::failure(&state, &cause),
                }
            }
        };

        info!(request_id = %id, phase = state.phase.name(), iterations = response.iterations, "request terminal");
        self.emit(&self.config.topics.response, kinds::USER_RESPONSE, &response)
            .await;

        self.partitions.insert(id.clone(), PartitionEntry::Terminal);
        let partitions = self.partitions.clone();
        let grace = self.config.request_gc_grace;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => {}
            }
            partitions.remove(&id);
        });
    }

    async fn emit<T: Serialize>(&self, topic: &TopicName, kind: &str, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind, error = %e, "payload serialization failed");
                return;
            }
        };
        let envelope = Envelope::new(kind, format!("pub:{topic}"), payload);
        match self.outbox.publish(topic, envelope).await {
            Ok(PublishStatus::DeliveredTo { .. }) => {}
            Ok(PublishStatus::NoSubscribers) => {
                warn!(topic = %topic, kind, "no subscribers for coordinator emission");
            }
            Ok(PublishStatus::Error { code }) => {
                warn!(topic = %topic, kind, code = %code, "coordinator emission failed");
            }
            Err(e) => {
                warn!(topic = %topic, kind, error = %e, "coordinator emission failed");
            }
        }
    }
}

/// Adapter embedding the coordinator behind the agent capability set
pub struct PevBehavior {
    coordinator: PevCoordinator,
}

impl PevBehavior {
    /// Wraps a coordinator
    pub fn new(coordinator: PevCoordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl AgentBehavior for PevBehavior {
    async fn handle_message(&self, envelope: Envelope) -> Result<Option<Envelope>, ClientError> {
        self.coordinator.dispatch(envelope).await;
        Ok(None)
    }

    async fn teardown(&self, _ctx: &AgentContext) -> Result<(), ClientError> {
        self.coordinator.shutdown().await;
        Ok(())
    }
}
