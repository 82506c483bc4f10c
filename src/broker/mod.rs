//! Message broker: topic fan-out and direct delivery with back-pressure
//!
//! Each agent holds one bidirectional framed connection that multiplexes
//! subscriptions, publications, direct sends, and inbound deliveries. The
//! routing table is owned by a single mutator task; fan-out takes a snapshot
//! of the current subscribers and delivers outside any lock. Per-publisher
//! order to a topic is preserved end-to-end; nothing survives a broker
//! restart.

mod connection;
mod routing;
mod server;

pub use server::{BrokerConfig, MessageBroker};

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Error code a publisher sees when a subscriber queue stays saturated past
/// the publish deadline
pub const ERR_BACKPRESSURE_TIMEOUT: &str = "backpressure_timeout";
/// Error code for publishes interrupted by cooperative cancellation
pub const ERR_CANCELLED: &str = "cancelled";

/// Live counters for the broker
///
/// Updated lock-free from connection tasks; snapshot for logging.
#[derive(Debug, Default)]
pub struct BrokerStats {
    pub connections_active: AtomicU64,
    pub subscriptions_active: AtomicU64,
    pub envelopes_delivered: AtomicU64,
    pub publishes_rejected: AtomicU64,
    pub direct_sends: AtomicU64,
}

/// Point-in-time view of [`BrokerStats`]
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatsSnapshot {
    pub connections_active: u64,
    pub subscriptions_active: u64,
    pub envelopes_delivered: u64,
    pub publishes_rejected: u64,
    pub direct_sends: u64,
}

impl BrokerStats {
    /// Takes a consistent-enough snapshot for reporting
    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            connections_active: self.connections_active.load(Ordering::Relaxed),
            subscriptions_active: self.subscriptions_active.load(Ordering::Relaxed),
            envelopes_delivered: self.envelopes_delivered.load(Ordering::Relaxed),
            publishes_rejected: self.publishes_rejected.load(Ordering::Relaxed),
            direct_sends: self.direct_sends.load(Ordering::Relaxed),
        }
    }
}
