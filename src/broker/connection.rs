//! Per-connection state machine
//!
//! `connecting -> authenticated -> active <-> draining -> closed`. The
//! handshake settles identity and codec, then the connection multiplexes
//! frames until drain or loss. Draining completes all framed outbound
//! writes, refuses new inbound work, then closes.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::broker::routing::{DeliveryQueue, RoutingCommand};
use crate::broker::{BrokerStats, ERR_BACKPRESSURE_TIMEOUT, ERR_CANCELLED};
use crate::domain_types::{AgentInstanceId, TopicName};
use crate::protocol::wire::CODEC_JSON;
use crate::protocol::{
    self, BrokerFrame, ClientFrame, Envelope, HandshakeReply, Hello, PROTOCOL_VERSION,
    ProtocolError, PublishStatus, SendStatus,
};
use crate::support::SupportRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Active,
    Draining,
}

/// Everything a connection task needs from the broker
pub(crate) struct ConnectionCtx {
    pub routing: mpsc::Sender<RoutingCommand>,
    pub registry: Option<SupportRegistry>,
    pub stats: Arc<BrokerStats>,
    pub cancel: CancellationToken,
    pub queue_capacity: usize,
    pub publish_deadline: Duration,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
    pub heartbeat_interval_ms: u64,
}

/// Serves one agent connection from handshake to close
pub(crate) async fn run_connection(stream: TcpStream, ctx: ConnectionCtx) {
    let peer = stream.peer_addr().ok();
    let (mut read_half, mut write_half) = stream.into_split();

    // connecting: the handshake frame must arrive promptly
    let hello: Hello = match tokio::time::timeout(
        ctx.handshake_timeout,
        protocol::read_frame(&mut read_half),
    )
    .await
    {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            debug!(peer = ?peer, error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            debug!(peer = ?peer, "handshake timed out");
            return;
        }
    };

    if hello.codec != CODEC_JSON {
        let _ = reject(&mut write_half, format!("unsupported codec: {}", hello.codec)).await;
        return;
    }
    if hello.protocol_version != PROTOCOL_VERSION {
        let _ = reject(
            &mut write_half,
            format!("unsupported protocol version: {}", hello.protocol_version),
        )
        .await;
        return;
    }

    let instance = hello.agent_id.clone();
    let (queue, delivery_rx) = mpsc::channel::<BrokerFrame>(ctx.queue_capacity);

    // authenticated: claim the instance id in the routing table
    let (reply, registered) = oneshot::channel();
    if ctx
        .routing
        .send(RoutingCommand::Register {
            instance: instance.clone(),
            queue: queue.clone(),
            reply,
        })
        .await
        .is_err()
        || !registered.await.unwrap_or(false)
    {
        let _ = reject(&mut write_half, "duplicate connection for instance".to_string()).await;
        return;
    }

    if protocol::write_frame(
        &mut write_half,
        &HandshakeReply::Welcome {
            heartbeat_interval_ms: ctx.heartbeat_interval_ms,
        },
    )
    .await
    .is_err()
    {
        ctx.routing
            .send(RoutingCommand::ConnectionClosed { instance })
            .await
            .ok();
        return;
    }

    ctx.stats.connections_active.fetch_add(1, Ordering::Relaxed);
    debug!(instance = %instance, peer = ?peer, "connection active");

    let writer = tokio::spawn(write_loop(delivery_rx, write_half));

    // active: multiplex inbound frames until drain, loss, or shutdown
    let mut state = ConnectionState::Active;
    loop {
        let frame: ClientFrame = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                state = ConnectionState::Draining;
                break;
            }
            frame = protocol::read_frame(&mut read_half) => match frame {
                Ok(frame) => frame,
                Err(ProtocolError::ConnectionClosed) => break,
                Err(e) => {
                    warn!(instance = %instance, error = %e, "protocol error, dropping connection");
                    break;
                }
            },
        };

        match frame {
            ClientFrame::Subscribe { topic } => match TopicName::try_new(topic) {
                Ok(topic) => {
                    let _ = ctx
                        .routing
                        .send(RoutingCommand::Subscribe {
                            topic,
                            instance: instance.clone(),
                            queue: queue.clone(),
                        })
                        .await;
                }
                Err(_) => {
                    warn!(instance = %instance, "malformed topic in subscribe, dropping connection");
                    break;
                }
            },
            ClientFrame::Unsubscribe { topic } => {
                if let Ok(topic) = TopicName::try_new(topic) {
                    let _ = ctx
                        .routing
                        .send(RoutingCommand::Unsubscribe {
                            topic,
                            instance: instance.clone(),
                        })
                        .await;
                }
            }
            ClientFrame::Publish {
                seq,
                topic,
                envelope,
            } => {
                let status = match TopicName::try_new(topic) {
                    Ok(topic) => fan_out(&ctx, &topic, envelope).await,
                    Err(_) => PublishStatus::Error {
                        code: "malformed_topic".to_string(),
                    },
                };
                if matches!(status, PublishStatus::Error { .. }) {
                    ctx.stats.publishes_rejected.fetch_add(1, Ordering::Relaxed);
                }
                if queue.send(BrokerFrame::PublishAck { seq, status }).await.is_err() {
                    break;
                }
            }
            ClientFrame::Send {
                seq,
                target,
                envelope,
            } => {
                let status = direct_send(&ctx, &target, envelope).await;
                if matches!(status, SendStatus::Delivered) {
                    ctx.stats.direct_sends.fetch_add(1, Ordering::Relaxed);
                }
                if queue.send(BrokerFrame::SendAck { seq, status }).await.is_err() {
                    break;
                }
            }
            ClientFrame::Drain => {
                trace!(instance = %instance, "drain requested");
                state = ConnectionState::Draining;
                break;
            }
        }
    }

    // draining/closed: make our routes invisible, then let queued writes flush
    let _ = ctx
        .routing
        .send(RoutingCommand::ConnectionClosed {
            instance: instance.clone(),
        })
        .await;
    drop(queue);
    if state == ConnectionState::Draining {
        let _ = tokio::time::timeout(ctx.drain_timeout, writer).await;
    } else {
        writer.abort();
    }

    if let Some(registry) = &ctx.registry {
        registry.mark_stopped(&instance).await;
    }
    ctx.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    debug!(instance = %instance, "connection closed");
}

async fn write_loop(mut delivery_rx: mpsc::Receiver<BrokerFrame>, mut write_half: OwnedWriteHalf) {
    while let Some(frame) = delivery_rx.recv().await {
        if protocol::write_frame(&mut write_half, &frame).await.is_err() {
            break;
        }
    }
}

async fn reject(write_half: &mut OwnedWriteHalf, reason: String) -> Result<(), ProtocolError> {
    protocol::write_frame(write_half, &HandshakeReply::Reject { reason }).await
}

/// Fans one envelope out to every current subscriber of the topic
///
/// A saturated subscriber queue blocks the publish up to the deadline, then
/// fails the whole publish: partial delivery is never reported as success.
async fn fan_out(ctx: &ConnectionCtx, topic: &TopicName, envelope: Envelope) -> PublishStatus {
    let (reply, snapshot_rx) = oneshot::channel();
    if ctx
        .routing
        .send(RoutingCommand::Snapshot {
            topic: topic.clone(),
            reply,
        })
        .await
        .is_err()
    {
        return PublishStatus::Error {
            code: ERR_CANCELLED.to_string(),
        };
    }
    let Ok(snapshot) = snapshot_rx.await else {
        return PublishStatus::Error {
            code: ERR_CANCELLED.to_string(),
        };
    };

    if snapshot.is_empty() {
        return PublishStatus::NoSubscribers;
    }

    let mut count = 0usize;
    for (subscriber, subscriber_queue) in snapshot {
        let frame = BrokerFrame::Deliver {
            envelope: envelope.clone(),
        };
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return PublishStatus::Error { code: ERR_CANCELLED.to_string() };
            }
            result = subscriber_queue.send_timeout(frame, ctx.publish_deadline) => match result {
                Ok(()) => {
                    count += 1;
                    ctx.stats.envelopes_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(topic = %topic, subscriber = %subscriber, "subscriber saturated past deadline");
                    return PublishStatus::Error { code: ERR_BACKPRESSURE_TIMEOUT.to_string() };
                }
                // Subscriber vanished mid-publish: it is no longer a current
                // subscriber, so it does not count against delivery.
                Err(SendTimeoutError::Closed(_)) => {}
            }
        }
    }

    PublishStatus::DeliveredTo { count }
}

async fn direct_send(ctx: &ConnectionCtx, target: &str, envelope: Envelope) -> SendStatus {
    let Ok(instance) = AgentInstanceId::try_new(target.to_string()) else {
        return SendStatus::NoSuchTarget;
    };
    let (reply, lookup_rx) = oneshot::channel();
    if ctx
        .routing
        .send(RoutingCommand::Lookup { instance, reply })
        .await
        .is_err()
    {
        return SendStatus::Error {
            code: ERR_CANCELLED.to_string(),
        };
    }
    let Ok(Some(target_queue)) = lookup_rx.await else {
        return SendStatus::NoSuchTarget;
    };
    match target_queue
        .send_timeout(BrokerFrame::Deliver { envelope }, ctx.publish_deadline)
        .await
    {
        Ok(()) => SendStatus::Delivered,
        Err(SendTimeoutError::Timeout(_)) => SendStatus::Error {
            code: ERR_BACKPRESSURE_TIMEOUT.to_string(),
        },
        Err(SendTimeoutError::Closed(_)) => SendStatus::NoSuchTarget,
    }
}
