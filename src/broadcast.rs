//! Fan-out of live measurements to connected subscribers.
//!
//! Membership changes and broadcasts share one mutex. Sends never block:
//! a subscriber that cannot take a payload right away is treated as failed
//! and removed at the end of the pass, so one slow client cannot stall the
//! rest of the feed.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    #[error("Subscriber channel closed")]
    Closed,
    #[error("Subscriber is lagging behind")]
    Lagging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One live channel able to accept serialized messages.
pub trait Subscriber: Send + Sync {
    /// Must return without waiting on the peer.
    fn send(&self, payload: Bytes) -> Result<(), SubscriberError>;
}

/// Subscriber backed by a bounded queue drained by the connection's writer task.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSubscriber {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn send(&self, payload: Bytes) -> Result<(), SubscriberError> {
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubscriberError::Lagging,
            mpsc::error::TrySendError::Closed(_) => SubscriberError::Closed,
        })
    }
}

/// Projection of a persisted measurement pushed to live clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveWeightUpdate {
    pub measurement_id: u64,
    pub animal_id: u64,
    pub animal_tag_id: String,
    pub estimated_weight_kg: f64,
    pub confidence_score: f64,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    Connection {
        status: &'static str,
        message: &'static str,
        active_connections: usize,
    },
    WeightUpdate {
        data: LiveWeightUpdate,
    },
    Heartbeat {
        active_connections: usize,
        timestamp: DateTime<Utc>,
    },
}

impl LiveMessage {
    fn welcome(active_connections: usize) -> Self {
        LiveMessage::Connection {
            status: "connected",
            message: "Connected to livestock live feed",
            active_connections,
        }
    }

    fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BroadcastStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_disconnections: u64,
    pub total_messages_sent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Arc<dyn Subscriber>>,
    total_connections: u64,
    total_disconnections: u64,
    total_messages_sent: u64,
}

#[derive(Default)]
pub struct BroadcastManager {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl BroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and sends it the welcome message.
    ///
    /// A subscriber that cannot take the welcome is dropped straight away
    /// and counted as disconnected.
    pub fn connect(&self, subscriber: Arc<dyn Subscriber>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock();

        inner.connections.insert(id, Arc::clone(&subscriber));
        inner.total_connections += 1;
        let active = inner.connections.len();

        let sent = LiveMessage::welcome(active)
            .to_bytes()
            .map_err(|e| tracing::error!("Failed to serialize welcome message: {}", e))
            .ok()
            .map(|payload| subscriber.send(payload));

        match sent {
            Some(Ok(())) => inner.total_messages_sent += 1,
            Some(Err(e)) => {
                tracing::warn!(connection = %id, "Failed to send welcome message: {}", e);
                inner.connections.remove(&id);
                inner.total_disconnections += 1;
            }
            None => {}
        }

        tracing::info!(
            connection = %id,
            "Live subscriber connected. Active connections: {}",
            inner.connections.len()
        );
        id
    }

    /// Removes a subscriber. Returns `false` when it was not connected.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.connections.remove(&id).is_some();
        if removed {
            inner.total_disconnections += 1;
            tracing::info!(
                connection = %id,
                "Live subscriber disconnected. Active connections: {}",
                inner.connections.len()
            );
        }
        removed
    }

    /// Sends one message to every subscriber, dropping those whose send fails.
    pub fn broadcast(&self, message: &LiveMessage) -> BroadcastReport {
        if self.inner.lock().connections.is_empty() {
            tracing::debug!("No active connections to broadcast to");
            return BroadcastReport::default();
        }

        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Broadcast serialization failed: {}", e);
                return BroadcastReport::default();
            }
        };

        let mut inner = self.inner.lock();
        Self::deliver(&mut inner, payload)
    }

    /// Sends a heartbeat carrying the subscriber count it is delivered to.
    pub fn heartbeat(&self) -> BroadcastReport {
        let mut inner = self.inner.lock();
        if inner.connections.is_empty() {
            return BroadcastReport::default();
        }

        let message = LiveMessage::Heartbeat {
            active_connections: inner.connections.len(),
            timestamp: Utc::now(),
        };
        match message.to_bytes() {
            Ok(payload) => Self::deliver(&mut inner, payload),
            Err(e) => {
                tracing::error!("Heartbeat serialization failed: {}", e);
                BroadcastReport::default()
            }
        }
    }

    fn deliver(inner: &mut Inner, payload: Bytes) -> BroadcastReport {
        let mut failed = Vec::new();
        let mut delivered = 0;

        for (id, subscriber) in inner.connections.iter() {
            match subscriber.send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(connection = %id, "Dropping live subscriber: {}", e);
                    failed.push(*id);
                }
            }
        }

        inner.total_messages_sent += delivered as u64;
        for id in &failed {
            inner.connections.remove(id);
        }
        inner.total_disconnections += failed.len() as u64;

        if !failed.is_empty() {
            tracing::info!(
                "Removed {} failed connections. Active: {}",
                failed.len(),
                inner.connections.len()
            );
        }

        BroadcastReport {
            delivered,
            dropped: failed.len(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        let inner = self.inner.lock();
        BroadcastStats {
            active_connections: inner.connections.len(),
            total_connections: inner.total_connections,
            total_disconnections: inner.total_disconnections,
            total_messages_sent: inner.total_messages_sent,
        }
    }

    /// Drops every subscriber. Their queues close once the last sender is gone.
    pub fn close_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let closed = inner.connections.len();
        inner.connections.clear();
        inner.total_disconnections += closed as u64;
        tracing::info!("Closed {} live connections", closed);
        closed
    }
}
