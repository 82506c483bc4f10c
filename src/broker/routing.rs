//! Routing table owned by a single mutator task
//!
//! Connection tasks never touch the table directly: subscribes,
//! unsubscribes, and closes arrive as queued updates, and fan-out asks for a
//! snapshot of the current subscriber set. The subscribe acknowledgement is
//! enqueued on the subscriber's delivery queue by the mutator itself, before
//! the subscription becomes visible, so the ack always precedes the first
//! delivery on that topic.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::broker::BrokerStats;
use crate::domain_types::{AgentInstanceId, TopicName};
use crate::protocol::BrokerFrame;

/// Bounded delivery queue feeding one subscriber connection's writer
pub(crate) type DeliveryQueue = mpsc::Sender<BrokerFrame>;

/// Updates and queries processed by the routing task
pub(crate) enum RoutingCommand {
    /// Makes an instance addressable for direct sends; `false` reply means
    /// the id already has a live connection
    Register {
        instance: AgentInstanceId,
        queue: DeliveryQueue,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        topic: TopicName,
        instance: AgentInstanceId,
        queue: DeliveryQueue,
    },
    Unsubscribe {
        topic: TopicName,
        instance: AgentInstanceId,
    },
    /// Current subscriber set of a topic, for fan-out outside the table
    Snapshot {
        topic: TopicName,
        reply: oneshot::Sender<Vec<(AgentInstanceId, DeliveryQueue)>>,
    },
    /// Direct-send route lookup
    Lookup {
        instance: AgentInstanceId,
        reply: oneshot::Sender<Option<DeliveryQueue>>,
    },
    /// Connection gone: drop its subscriptions and direct route atomically
    ConnectionClosed { instance: AgentInstanceId },
    /// Registry declared the instance stale: free its subscriptions
    DropInstance { instance: AgentInstanceId },
}

#[derive(Default)]
struct RoutingTable {
    topics: HashMap<TopicName, Vec<(AgentInstanceId, DeliveryQueue)>>,
    direct: HashMap<AgentInstanceId, DeliveryQueue>,
}

impl RoutingTable {
    fn drop_instance(&mut self, instance: &AgentInstanceId, stats: &BrokerStats) {
        self.direct.remove(instance);
        self.topics.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|(id, _)| id != instance);
            let removed = before - subscribers.len();
            if removed > 0 {
                stats
                    .subscriptions_active
                    .fetch_sub(removed as u64, Ordering::Relaxed);
            }
            !subscribers.is_empty()
        });
    }
}

/// Runs the routing mutator until the command channel closes
pub(crate) async fn run_routing(
    mut commands: mpsc::Receiver<RoutingCommand>,
    stats: Arc<BrokerStats>,
) {
    let mut table = RoutingTable::default();

    while let Some(command) = commands.recv().await {
        match command {
            RoutingCommand::Register {
                instance,
                queue,
                reply,
            } => {
                let fresh = !table.direct.contains_key(&instance);
                if fresh {
                    table.direct.insert(instance.clone(), queue);
                    debug!(instance = %instance, "connection registered");
                }
                let _ = reply.send(fresh);
            }
            RoutingCommand::Subscribe {
                topic,
                instance,
                queue,
            } => {
                let subscribers = table.topics.entry(topic.clone()).or_default();
                let already = subscribers.iter().any(|(id, _)| id == &instance);
                // Ack first: the queue is FIFO, so the confirmation reaches
                // the subscriber before any delivery on this topic.
                let acked = queue
                    .try_send(BrokerFrame::SubscribeAck {
                        topic: topic.to_string(),
                    })
                    .is_ok();
                if acked && !already {
                    subscribers.push((instance.clone(), queue));
                    stats.subscriptions_active.fetch_add(1, Ordering::Relaxed);
                    trace!(topic = %topic, instance = %instance, "subscribed");
                }
            }
            RoutingCommand::Unsubscribe { topic, instance } => {
                if let Some(subscribers) = table.topics.get_mut(&topic) {
                    let before = subscribers.len();
                    subscribers.retain(|(id, _)| id != &instance);
                    if subscribers.len() < before {
                        stats.subscriptions_active.fetch_sub(1, Ordering::Relaxed);
                    }
                    if subscribers.is_empty() {
                        table.topics.remove(&topic);
                    }
                }
                if let Some(queue) = table.direct.get(&instance) {
                    let _ = queue.try_send(BrokerFrame::UnsubscribeAck {
                        topic: topic.to_string(),
                    });
                }
            }
            RoutingCommand::Snapshot { topic, reply } => {
                let snapshot = table.topics.get(&topic).cloned().unwrap_or_default();
                let _ = reply.send(snapshot);
            }
            RoutingCommand::Lookup { instance, reply } => {
                let _ = reply.send(table.direct.get(&instance).cloned());
            }
            RoutingCommand::ConnectionClosed { instance } => {
                debug!(instance = %instance, "connection closed, routes dropped");
                table.drop_instance(&instance, &stats);
            }
            RoutingCommand::DropInstance { instance } => {
                debug!(instance = %instance, "stale instance, subscriptions freed");
                table.drop_instance(&instance, &stats);
            }
        }
    }
}
