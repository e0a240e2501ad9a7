//! Metrics collection for chatrelay
//!
//! Simple internal counters for relay health, reported by the operator
//! console's `stats` command. Each relay owns its own instance.

use std::sync::atomic::{AtomicU64, Ordering};

/// Relay counters
#[derive(Debug, Default)]
pub struct Metrics {
    /// Connections accepted by the listener
    pub connections_accepted_total: AtomicU64,
    /// Connections dropped during the join handshake
    pub handshakes_rejected_total: AtomicU64,
    /// Sessions that completed the join handshake
    pub sessions_joined_total: AtomicU64,
    /// Sessions torn down after joining
    pub sessions_departed_total: AtomicU64,
    /// Chat messages routed
    pub chat_routed_total: AtomicU64,
    /// Direct messages routed (including misses)
    pub direct_routed_total: AtomicU64,
    /// Individual deliveries that failed
    pub delivery_failures_total: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub handshakes_rejected: u64,
    pub sessions_joined: u64,
    pub sessions_departed: u64,
    pub chat_routed: u64,
    pub direct_routed: u64,
    pub delivery_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self) {
        self.connections_accepted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_rejected(&self) {
        self.handshakes_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join(&self) {
        self.sessions_joined_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_departure(&self) {
        self.sessions_departed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chat(&self) {
        self.chat_routed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_direct(&self) {
        self.direct_routed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` failed deliveries
    pub fn record_delivery_failures(&self, count: usize) {
        if count > 0 {
            self.delivery_failures_total
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted_total.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected_total.load(Ordering::Relaxed),
            sessions_joined: self.sessions_joined_total.load(Ordering::Relaxed),
            sessions_departed: self.sessions_departed_total.load(Ordering::Relaxed),
            chat_routed: self.chat_routed_total.load(Ordering::Relaxed),
            direct_routed: self.direct_routed_total.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures_total.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "connections accepted: {}", self.connections_accepted)?;
        writeln!(f, "handshakes rejected:  {}", self.handshakes_rejected)?;
        writeln!(f, "sessions joined:      {}", self.sessions_joined)?;
        writeln!(f, "sessions departed:    {}", self.sessions_departed)?;
        writeln!(f, "chat routed:          {}", self.chat_routed)?;
        writeln!(f, "direct routed:        {}", self.direct_routed)?;
        write!(f, "delivery failures:    {}", self.delivery_failures)
    }
}
