//! Client library embedded by every agent
//!
//! One supervisor task owns the broker connection and multiplexes commands
//! (subscribe, publish, send, drain) with inbound deliveries. Connection loss
//! is handled by reconnecting with exponential backoff and replaying the
//! subscription set; callers with in-flight acknowledgements see a named
//! error and decide for themselves.

mod runtime;
mod support;

pub use runtime::{
    AgentRuntime, ENV_AGENT_ID, ENV_AGENT_TYPE, ENV_CONFIG_OVERRIDES, ENV_DATA_ROOT,
    ENV_PROJECT_ID, ENV_SESSION_LOG, ENV_SUPPORT_ENDPOINT,
};
pub use support::SupportClient;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain_types::{AgentInstanceId, ProjectId, TopicName};
use crate::protocol::envelope::META_SENDER;
use crate::protocol::wire::CODEC_JSON;
use crate::protocol::{
    self, BrokerFrame, ClientFrame, Envelope, HandshakeReply, Hello, PROTOCOL_VERSION,
    ProtocolError, PublishStatus, SendStatus, Target,
};

/// Topic envelopes land on when a handler fails and the framework
/// dead-letters the message
pub const DEAD_LETTER_TOPIC: &str = "dead.letter";

/// Envelope kind that asks an agent to drain and exit
pub const SHUTDOWN_KIND: &str = "shutdown";

/// Errors surfaced by the client library
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("broker rejected connection: {reason}")]
    Rejected { reason: String },

    #[error("connection lost")]
    Disconnected,

    #[error("{operation} timed out")]
    Timeout { operation: String },

    #[error("support service error: {code}: {message}")]
    Support { code: String, message: String },

    #[error("handler error: {0}")]
    Handler(String),

    #[error("missing environment variable: {name}")]
    MissingEnv { name: String },

    #[error("invalid value for {what}: {value}")]
    InvalidValue { what: String, value: String },
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Exponential reconnect backoff
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(15),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given retry attempt (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Connection settings for one agent
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub broker_endpoint: String,
    pub agent_id: AgentInstanceId,
    pub project_id: ProjectId,
    /// Routing expression handler responses go through when they carry no
    /// explicit target
    pub egress: Option<String>,
    pub inbound_capacity: usize,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub reconnect: BackoffPolicy,
}

impl ClientConfig {
    /// Settings for an agent identified by `agent_id` in `project_id`
    pub fn new(
        broker_endpoint: impl Into<String>,
        agent_id: AgentInstanceId,
        project_id: ProjectId,
    ) -> Self {
        Self {
            broker_endpoint: broker_endpoint.into(),
            agent_id,
            project_id,
            egress: None,
            inbound_capacity: 256,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(30),
            reconnect: BackoffPolicy::default(),
        }
    }

    /// Sets the declared egress expression
    #[must_use]
    pub fn with_egress(mut self, egress: impl Into<String>) -> Self {
        self.egress = Some(egress.into());
        self
    }
}

/// Execution context handed to agent behaviors
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent_id: AgentInstanceId,
    pub project_id: ProjectId,
    pub data_root: Option<PathBuf>,
    pub config: Map<String, Value>,
}

/// The capability set an agent implements
///
/// Agents do not inherit from a framework base; the runtime composes this
/// with connection management, heartbeating, and config resolution. The
/// handler returns a response envelope to route through the declared egress,
/// `None` for a terminal sink, or an error that is logged and dead-lettered.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Called once before the first message
    async fn initialize(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    /// Handles one inbound envelope
    async fn handle_message(&self, envelope: Envelope) -> Result<Option<Envelope>>;

    /// Called once after the last message
    async fn teardown(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }
}

enum ClientCommand {
    Subscribe {
        topic: TopicName,
        ack: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        topic: TopicName,
    },
    Publish {
        topic: TopicName,
        envelope: Envelope,
        ack: oneshot::Sender<Result<PublishStatus>>,
    },
    Send {
        target: AgentInstanceId,
        envelope: Envelope,
        ack: oneshot::Sender<Result<SendStatus>>,
    },
    Drain {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a live broker connection
#[derive(Clone)]
pub struct AgenClient {
    config: Arc<ClientConfig>,
    cmd_tx: mpsc::Sender<ClientCommand>,
    inbound: Arc<Mutex<Option<mpsc::Receiver<Envelope>>>>,
    cancel: CancellationToken,
}

impl AgenClient {
    /// Connects and completes the handshake
    ///
    /// # Errors
    ///
    /// Fails fast on connect timeout, handshake rejection, or protocol
    /// errors; later connection loss is retried internally instead.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let stream = connect_once(&config).await?;
        info!(agent_id = %config.agent_id, broker = %config.broker_endpoint, "connected to broker");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let cancel = CancellationToken::new();
        let config = Arc::new(config);

        let supervisor = Supervisor {
            config: config.clone(),
            cmd_rx,
            inbound_tx,
            subscribed: HashSet::new(),
            pending_sub: HashMap::new(),
            pending_pub: HashMap::new(),
            pending_send: HashMap::new(),
            seq: 0,
            cancel: cancel.clone(),
        };
        tokio::spawn(supervisor.run(stream));

        Ok(Self {
            config,
            cmd_tx,
            inbound: Arc::new(Mutex::new(Some(inbound_rx))),
            cancel,
        })
    }

    /// This client's instance id
    pub fn agent_id(&self) -> &AgentInstanceId {
        &self.config.agent_id
    }

    /// Declares a subscription; returns after the broker confirms it
    pub async fn subscribe(&self, topic: TopicName) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Subscribe { topic, ack })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        self.await_ack(ack_rx, "subscribe").await?
    }

    /// Removes a subscription; queued deliveries may still arrive
    pub async fn unsubscribe(&self, topic: TopicName) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Unsubscribe { topic })
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    /// Publishes to a topic and reports the aggregate delivery status
    pub async fn publish_to(&self, topic: TopicName, envelope: Envelope) -> Result<PublishStatus> {
        let envelope = self.stamp_sender(envelope);
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Publish {
                topic,
                envelope,
                ack,
            })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        self.await_ack(ack_rx, "publish").await?
    }

    /// Delivers directly to one live instance
    pub async fn send_to(
        &self,
        target: AgentInstanceId,
        envelope: Envelope,
    ) -> Result<SendStatus> {
        let envelope = self.stamp_sender(envelope);
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Send {
                target,
                envelope,
                ack,
            })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        self.await_ack(ack_rx, "send").await?
    }

    /// Routes an envelope by its target expression
    ///
    /// `pub:`/`channel:` publish, a bare instance id sends directly, and
    /// `file:` appends the payload as one JSON line, with `{id}` in the path
    /// template substituted by the envelope id.
    pub async fn route(&self, envelope: Envelope) -> Result<()> {
        match envelope.parsed_target()? {
            Target::Publish(topic) | Target::Channel(topic) => {
                self.publish_to(topic, envelope).await?;
                Ok(())
            }
            Target::Direct(instance) => {
                self.send_to(instance, envelope).await?;
                Ok(())
            }
            Target::File(template) => {
                let path = template.replace("{id}", &envelope.id.to_string());
                append_json_line(&path, &envelope.payload).await
            }
            Target::Subscribe(topic) => {
                self.subscribe(topic).await
            }
        }
    }

    /// Takes the inbound delivery stream; the first caller owns it
    pub async fn deliveries(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inbound.lock().await.take()
    }

    /// Runs a behavior against the inbound stream until drain or shutdown
    ///
    /// A `shutdown` envelope triggers a graceful drain. Handler errors are
    /// logged and the offending envelope is dead-lettered.
    pub async fn run(&self, behavior: Arc<dyn AgentBehavior>, ctx: AgentContext) -> Result<()> {
        let Some(mut deliveries) = self.deliveries().await else {
            return Err(ClientError::Handler(
                "delivery stream already claimed".to_string(),
            ));
        };
        behavior.initialize(&ctx).await?;

        while let Some(envelope) = deliveries.recv().await {
            if envelope.kind == SHUTDOWN_KIND {
                info!(agent_id = %self.config.agent_id, "shutdown envelope received, draining");
                break;
            }
            match behavior.handle_message(envelope.clone()).await {
                Ok(Some(response)) => {
                    let response = self.apply_egress(response);
                    if let Err(e) = self.route(response).await {
                        warn!(agent_id = %self.config.agent_id, error = %e, "egress routing failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(agent_id = %self.config.agent_id, error = %e, kind = %envelope.kind, "handler failed, dead-lettering");
                    self.dead_letter(envelope, &e).await;
                }
            }
        }

        behavior.teardown(&ctx).await?;
        self.drain().await
    }

    /// Gracefully drains: stop new work, flush in-flight frames, close
    pub async fn drain(&self) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        if self.cmd_tx.send(ClientCommand::Drain { done }).await.is_ok() {
            let _ = done_rx.await;
        }
        self.cancel.cancel();
        Ok(())
    }

    async fn dead_letter(&self, envelope: Envelope, error: &ClientError) {
        let topic = TopicName::try_new(DEAD_LETTER_TOPIC.to_string())
            .unwrap_or_else(|_| unreachable!("constant topic is valid"));
        let letter = Envelope::new(
            "dead_letter",
            format!("pub:{DEAD_LETTER_TOPIC}"),
            serde_json::json!({
                "original": envelope,
                "error": error.to_string(),
            }),
        );
        if let Err(e) = self.publish_to(topic, letter).await {
            warn!(agent_id = %self.config.agent_id, error = %e, "dead-letter publish failed");
        }
    }

    fn apply_egress(&self, mut envelope: Envelope) -> Envelope {
        if envelope.target.is_empty()
            && let Some(egress) = &self.config.egress
        {
            envelope.target = egress.clone();
        }
        envelope
    }

    fn stamp_sender(&self, envelope: Envelope) -> Envelope {
        if envelope.meta.contains_key(META_SENDER) {
            envelope
        } else {
            envelope.from_sender(&self.config.agent_id)
        }
    }

    async fn await_ack<T>(
        &self,
        ack_rx: oneshot::Receiver<Result<T>>,
        operation: &str,
    ) -> Result<Result<T>> {
        match tokio::time::timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }
}

async fn append_json_line(path: &str, payload: &Value) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut line = serde_json::to_vec(payload).map_err(ProtocolError::from)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(ProtocolError::from)?;
    file.write_all(&line).await.map_err(ProtocolError::from)?;
    Ok(())
}

async fn connect_once(config: &ClientConfig) -> Result<TcpStream> {
    let connect = TcpStream::connect(&config.broker_endpoint);
    let mut stream = match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProtocolError::from(e).into()),
        Err(_) => {
            return Err(ClientError::Timeout {
                operation: "connect".to_string(),
            });
        }
    };

    let hello = Hello {
        agent_id: config.agent_id.clone(),
        project_id: config.project_id.clone(),
        codec: CODEC_JSON.to_string(),
        protocol_version: PROTOCOL_VERSION,
    };
    protocol::write_frame(&mut stream, &hello).await?;
    match protocol::read_frame(&mut stream).await? {
        HandshakeReply::Welcome { .. } => Ok(stream),
        HandshakeReply::Reject { reason } => Err(ClientError::Rejected { reason }),
    }
}

enum SessionEnd {
    Drained,
    Lost,
}

struct Supervisor {
    config: Arc<ClientConfig>,
    cmd_rx: mpsc::Receiver<ClientCommand>,
    inbound_tx: mpsc::Sender<Envelope>,
    subscribed: HashSet<TopicName>,
    pending_sub: HashMap<String, Vec<oneshot::Sender<Result<()>>>>,
    pending_pub: HashMap<u64, oneshot::Sender<Result<PublishStatus>>>,
    pending_send: HashMap<u64, oneshot::Sender<Result<SendStatus>>>,
    seq: u64,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self, stream: TcpStream) {
        let mut stream = Some(stream);
        loop {
            if let Some(session) = stream.take() {
                match self.run_session(session).await {
                    SessionEnd::Drained => break,
                    SessionEnd::Lost => {}
                }
                if self.cancel.is_cancelled() {
                    break;
                }
                self.fail_pending();
            }

            // reconnect with backoff, then replay the subscription set
            let mut attempt = 0u32;
            let mut fresh = loop {
                if self.cancel.is_cancelled() {
                    return;
                }
                tokio::time::sleep(self.config.reconnect.delay(attempt)).await;
                match connect_once(&self.config).await {
                    Ok(fresh) => break fresh,
                    Err(e) => {
                        debug!(agent_id = %self.config.agent_id, attempt, error = %e, "reconnect failed");
                        attempt = attempt.saturating_add(1);
                    }
                }
            };
            info!(agent_id = %self.config.agent_id, "reconnected, replaying subscriptions");
            let mut ok = true;
            for topic in self.subscribed.clone() {
                let frame = ClientFrame::Subscribe {
                    topic: topic.to_string(),
                };
                if protocol::write_frame(&mut fresh, &frame).await.is_err() {
                    ok = false;
                    break;
                }
            }
            if ok {
                stream = Some(fresh);
            }
        }
    }

    async fn run_session(&mut self, stream: TcpStream) -> SessionEnd {
        let (read_half, mut write_half) = stream.into_split();
        let mut draining: Option<oneshot::Sender<()>> = None;

        // dedicated reader: frame reads must never be interrupted mid-frame,
        // so they happen on their own task and arrive through a channel
        let (frame_tx, mut frame_rx) = mpsc::channel::<BrokerFrame>(64);
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                match protocol::read_frame::<_, BrokerFrame>(&mut read_half).await {
                    Ok(frame) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SessionEnd::Drained,

                command = self.cmd_rx.recv(), if draining.is_none() => {
                    let Some(command) = command else { break SessionEnd::Drained };
                    match command {
                        ClientCommand::Subscribe { topic, ack } => {
                            if self.subscribed.contains(&topic) {
                                let _ = ack.send(Ok(()));
                                continue;
                            }
                            let frame = ClientFrame::Subscribe { topic: topic.to_string() };
                            self.pending_sub.entry(topic.to_string()).or_default().push(ack);
                            if protocol::write_frame(&mut write_half, &frame).await.is_err() {
                                break SessionEnd::Lost;
                            }
                        }
                        ClientCommand::Unsubscribe { topic } => {
                            self.subscribed.remove(&topic);
                            let frame = ClientFrame::Unsubscribe { topic: topic.to_string() };
                            if protocol::write_frame(&mut write_half, &frame).await.is_err() {
                                break SessionEnd::Lost;
                            }
                        }
                        ClientCommand::Publish { topic, envelope, ack } => {
                            self.seq += 1;
                            let frame = ClientFrame::Publish {
                                seq: self.seq,
                                topic: topic.to_string(),
                                envelope,
                            };
                            self.pending_pub.insert(self.seq, ack);
                            if protocol::write_frame(&mut write_half, &frame).await.is_err() {
                                break SessionEnd::Lost;
                            }
                        }
                        ClientCommand::Send { target, envelope, ack } => {
                            self.seq += 1;
                            let frame = ClientFrame::Send {
                                seq: self.seq,
                                target: target.to_string(),
                                envelope,
                            };
                            self.pending_send.insert(self.seq, ack);
                            if protocol::write_frame(&mut write_half, &frame).await.is_err() {
                                break SessionEnd::Lost;
                            }
                        }
                        ClientCommand::Drain { done } => {
                            if protocol::write_frame(&mut write_half, &ClientFrame::Drain).await.is_err() {
                                let _ = done.send(());
                                break SessionEnd::Drained;
                            }
                            draining = Some(done);
                        }
                    }
                }

                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        // reader ended: clean close while draining, loss otherwise
                        if let Some(done) = draining.take() {
                            let _ = done.send(());
                            break SessionEnd::Drained;
                        }
                        break SessionEnd::Lost;
                    };
                    match frame {
                        BrokerFrame::SubscribeAck { topic } => {
                            if let Ok(topic_name) = TopicName::try_new(topic.clone()) {
                                self.subscribed.insert(topic_name);
                            }
                            for ack in self.pending_sub.remove(&topic).unwrap_or_default() {
                                let _ = ack.send(Ok(()));
                            }
                        }
                        BrokerFrame::UnsubscribeAck { .. } => {}
                        BrokerFrame::PublishAck { seq, status } => {
                            if let Some(ack) = self.pending_pub.remove(&seq) {
                                let _ = ack.send(Ok(status));
                            }
                        }
                        BrokerFrame::SendAck { seq, status } => {
                            if let Some(ack) = self.pending_send.remove(&seq) {
                                let _ = ack.send(Ok(status));
                            }
                        }
                        BrokerFrame::Deliver { envelope } => {
                            // A full inbound queue intentionally stalls this
                            // loop: the broker's queue for this connection
                            // then fills, which is how back-pressure reaches
                            // publishers.
                            if self.inbound_tx.send(envelope).await.is_err() {
                                break SessionEnd::Drained;
                            }
                        }
                    }
                }
            }
        };

        reader.abort();
        end
    }

    fn fail_pending(&mut self) {
        for (_, waiters) in self.pending_sub.drain() {
            for ack in waiters {
                let _ = ack.send(Err(ClientError::Disconnected));
            }
        }
        for (_, ack) in self.pending_pub.drain() {
            let _ = ack.send(Err(ClientError::Disconnected));
        }
        for (_, ack) in self.pending_send.drain() {
            let _ = ack.send(Err(ClientError::Disconnected));
        }
    }
}
