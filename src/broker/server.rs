//! Broker endpoint: accept loop, routing task, and lifecycle

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::connection::{ConnectionCtx, run_connection};
use crate::broker::routing::{RoutingCommand, run_routing};
use crate::broker::{BrokerStats, BrokerStatsSnapshot};
use crate::domain_types::{AgentInstanceId, QueueCapacity};
use crate::support::SupportRegistry;

/// Broker tuning knobs
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind, `host:port`; port 0 picks a free port
    pub bind: String,
    /// Inbound queue capacity per subscriber connection
    pub subscriber_queue_capacity: QueueCapacity,
    /// How long a publish may block on a saturated subscriber
    pub publish_deadline: Duration,
    /// How long a fresh connection may take to complete the handshake
    pub handshake_timeout: Duration,
    /// How long a draining connection may take to flush framed writes
    pub drain_timeout: Duration,
    /// Heartbeat interval advertised to agents in the welcome frame
    pub heartbeat_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            subscriber_queue_capacity: QueueCapacity::try_new(1024)
                .unwrap_or_else(|_| unreachable!("1024 is within bounds")),
            publish_deadline: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Running broker
pub struct MessageBroker {
    local_addr: SocketAddr,
    stats: Arc<BrokerStats>,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    routing_task: JoinHandle<()>,
}

impl MessageBroker {
    /// Binds the broker, starts routing, and advertises the endpoint
    ///
    /// When a registry handle is given, the broker registers its endpoint on
    /// startup and consumes the stale-instance channel, freeing the
    /// subscriptions of instances the health scanner declared stopped.
    ///
    /// # Errors
    ///
    /// Returns the bind error; the orchestrator maps it to its exit code.
    pub async fn start(
        config: BrokerConfig,
        registry: Option<SupportRegistry>,
        stale_rx: Option<mpsc::UnboundedReceiver<AgentInstanceId>>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "broker listening");

        let stats = Arc::new(BrokerStats::default());
        let (routing_tx, routing_rx) = mpsc::channel::<RoutingCommand>(4096);
        let routing_task = tokio::spawn(run_routing(routing_rx, stats.clone()));

        if let Some(mut stale_rx) = stale_rx {
            let routing_tx = routing_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        stale = stale_rx.recv() => match stale {
                            Some(instance) => {
                                let _ = routing_tx
                                    .send(RoutingCommand::DropInstance { instance })
                                    .await;
                            }
                            None => break,
                        }
                    }
                }
            });
        }

        if let Some(registry) = &registry {
            registry.set_broker_endpoint(local_addr.to_string()).await;
        }

        let accept_task = {
            let stats = stats.clone();
            let cancel = cancel.clone();
            let routing_tx = routing_tx.clone();
            let config = config.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => {
                            let Ok((stream, peer)) = accepted else { continue };
                            debug!(peer = %peer, "broker connection accepted");
                            let ctx = ConnectionCtx {
                                routing: routing_tx.clone(),
                                registry: registry.clone(),
                                stats: stats.clone(),
                                cancel: cancel.clone(),
                                queue_capacity: config.subscriber_queue_capacity.as_usize(),
                                publish_deadline: config.publish_deadline,
                                handshake_timeout: config.handshake_timeout,
                                drain_timeout: config.drain_timeout,
                                heartbeat_interval_ms: config.heartbeat_interval.as_millis() as u64,
                            };
                            tokio::spawn(run_connection(stream, ctx));
                        }
                    }
                }
            })
        };

        Ok(Self {
            local_addr,
            stats,
            cancel,
            accept_task,
            routing_task,
        })
    }

    /// Address the broker actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current counters
    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared handle to the live counters, for periodic reporting
    pub fn shared_stats(&self) -> Arc<BrokerStats> {
        self.stats.clone()
    }

    /// Cancels the accept loop and drains connections
    ///
    /// Nothing is persisted; in-flight frames already handed to the wire are
    /// not recalled.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.accept_task.await;
        self.routing_task.abort();
    }
}
