use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::metrics::GatewayMetrics;

pub mod connection;
pub mod events;
pub mod queue;
pub mod router;
pub mod session;
pub mod subscriber;

pub use connection::{ConnectionId, ConnectionState};
pub use events::ServerEvent;
pub use queue::{outbound_queue, OutboundReceiver, OutboundSender, PushOutcome};
pub use router::{EventRouter, RouteReport};
pub use subscriber::{BroadcastSubscriber, SubscriberConfig};

/// Live connection entry with its outbound queue
struct Connection {
    id: ConnectionId,
    sender: OutboundSender,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    // user_id -> live connections (one per device); a user with none has no entry
    connections: HashMap<Uuid, Vec<Connection>>,
}

/// Result of [`ConnectionRegistry::add`].
pub struct Registration {
    pub connection_id: ConnectionId,
    pub receiver: OutboundReceiver,
    /// Connect time of the user's newest connection that was still live,
    /// `None` when this is their only connection.
    pub previous_conn_at: Option<DateTime<Utc>>,
}

/// Per-user fan-out tally from [`ConnectionRegistry::send_to_user`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Enqueued, but an older frame was evicted to make room.
    pub dropped_oldest: usize,
    /// Connections found closed and pruned.
    pub closed: usize,
}

/// Connection registry for live subscribers
///
/// Maps a user to every live connection they hold. Cloning shares the same
/// registry; build one per gateway and pass it to the router and the
/// connection-accept path.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryState>>,
    queue_capacity: usize,
    metrics: Option<GatewayMetrics>,
}

impl ConnectionRegistry {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryState::default())),
            queue_capacity: queue_capacity.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<&GatewayMetrics> {
        self.metrics.as_ref()
    }

    /// Register a new connection for `user_id`
    ///
    /// Existing connections of the same user stay registered.
    pub async fn add(&self, user_id: Uuid) -> Registration {
        let (sender, receiver) = outbound_queue(self.queue_capacity);
        let connection_id = ConnectionId::new();
        let now = Utc::now();

        let mut guard = self.inner.write().await;
        let connections = guard.connections.entry(user_id).or_default();
        let previous_conn_at = connections.iter().map(|c| c.connected_at).max();
        connections.push(Connection {
            id: connection_id,
            sender,
            connected_at: now,
        });

        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            devices = connections.len(),
            reconnect = previous_conn_at.is_some(),
            "Connection registered"
        );

        if let Some(metrics) = &self.metrics {
            metrics.active_connections.inc();
        }

        Registration {
            connection_id,
            receiver,
            previous_conn_at,
        }
    }

    /// Remove exactly one connection. Returns `false` if it was already gone.
    pub async fn remove(&self, user_id: Uuid, connection_id: ConnectionId) -> bool {
        let mut guard = self.inner.write().await;
        let Some(connections) = guard.connections.get_mut(&user_id) else {
            return false;
        };

        let Some(index) = connections.iter().position(|c| c.id == connection_id) else {
            return false;
        };
        let removed = connections.swap_remove(index);
        removed.sender.close();

        if connections.is_empty() {
            guard.connections.remove(&user_id);
        }

        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            "Connection removed"
        );

        if let Some(metrics) = &self.metrics {
            metrics.active_connections.dec();
        }
        true
    }

    /// Enqueue `frame` on every live connection of `user_id` without waiting
    /// on any of them. Offline users are a silent no-op.
    pub async fn send_to_user(&self, user_id: Uuid, frame: &str) -> Delivery {
        let mut delivery = Delivery::default();
        {
            let guard = self.inner.read().await;
            let Some(connections) = guard.connections.get(&user_id) else {
                return delivery;
            };
            for connection in connections {
                match connection.sender.push(frame.to_string()) {
                    PushOutcome::Queued => delivery.delivered += 1,
                    PushOutcome::DroppedOldest => {
                        delivery.delivered += 1;
                        delivery.dropped_oldest += 1;
                    }
                    PushOutcome::Closed => delivery.closed += 1,
                }
            }
        }

        if delivery.closed > 0 {
            self.prune_closed(user_id).await;
        }

        if let Some(metrics) = &self.metrics {
            metrics.messages_delivered.inc_by(delivery.delivered as u64);
            metrics
                .messages_dropped
                .inc_by(delivery.dropped_oldest as u64);
        }
        delivery
    }

    async fn prune_closed(&self, user_id: Uuid) {
        let mut guard = self.inner.write().await;
        if let Some(connections) = guard.connections.get_mut(&user_id) {
            let before = connections.len();
            connections.retain(|c| !c.sender.is_closed());
            let pruned = before - connections.len();
            if connections.is_empty() {
                guard.connections.remove(&user_id);
            }
            if pruned > 0 {
                tracing::debug!(user_id = %user_id, pruned, "Pruned closed connections");
                if let Some(metrics) = &self.metrics {
                    metrics.active_connections.sub(pruned as i64);
                }
            }
        }
    }

    /// Live connections for one user (for debugging/metrics)
    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.connections.get(&user_id).map(|v| v.len()).unwrap_or(0)
    }

    pub async fn total_connections(&self) -> usize {
        let guard = self.inner.read().await;
        guard.connections.values().map(|v| v.len()).sum()
    }

    pub async fn online_users(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multi_device_fan_out() {
        let registry = ConnectionRegistry::new(8);
        let user = Uuid::new_v4();

        let mut phone = registry.add(user).await;
        let mut laptop = registry.add(user).await;
        assert_eq!(registry.connection_count(user).await, 2);

        let delivery = registry.send_to_user(user, "hello").await;
        assert_eq!(delivery.delivered, 2);

        assert_eq!(phone.receiver.recv().await.as_deref(), Some("hello"));
        assert_eq!(laptop.receiver.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn remove_only_affects_one_connection() {
        let registry = ConnectionRegistry::new(8);
        let user = Uuid::new_v4();

        let phone = registry.add(user).await;
        let mut laptop = registry.add(user).await;

        assert!(registry.remove(user, phone.connection_id).await);
        assert!(!registry.remove(user, phone.connection_id).await);
        assert_eq!(registry.connection_count(user).await, 1);

        registry.send_to_user(user, "still here").await;
        assert_eq!(laptop.receiver.recv().await.as_deref(), Some("still here"));

        assert!(registry.remove(user, laptop.connection_id).await);
        assert_eq!(registry.online_users().await, 0);
    }

    #[tokio::test]
    async fn offline_user_is_a_no_op() {
        let registry = ConnectionRegistry::new(8);
        let delivery = registry.send_to_user(Uuid::new_v4(), "nobody home").await;
        assert_eq!(delivery, Delivery::default());
    }

    #[tokio::test]
    async fn second_connection_reports_previous_connect_time() {
        let registry = ConnectionRegistry::new(8);
        let user = Uuid::new_v4();

        let first = registry.add(user).await;
        assert!(first.previous_conn_at.is_none());

        let second = registry.add(user).await;
        assert!(second.previous_conn_at.is_some());
        assert!(second.previous_conn_at <= Some(Utc::now()));
    }

    #[tokio::test]
    async fn departed_users_leave_no_state_behind() {
        let registry = ConnectionRegistry::new(8);

        for _ in 0..1_000 {
            let user = Uuid::new_v4();
            let registration = registry.add(user).await;
            assert!(registry.remove(user, registration.connection_id).await);
        }
        assert_eq!(registry.online_users().await, 0);
        assert_eq!(registry.inner.read().await.connections.len(), 0);

        let user = Uuid::new_v4();
        let registration = registry.add(user).await;
        registry.remove(user, registration.connection_id).await;
        assert!(registry.add(user).await.previous_conn_at.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_send() {
        let registry = ConnectionRegistry::new(8);
        let user = Uuid::new_v4();

        let registration = registry.add(user).await;
        drop(registration.receiver);

        let delivery = registry.send_to_user(user, "gone").await;
        assert_eq!(delivery.closed, 1);
        assert_eq!(registry.connection_count(user).await, 0);
    }

    #[tokio::test]
    async fn concurrent_add_and_remove() {
        let registry = ConnectionRegistry::new(8);
        let user = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let registration = registry.add(user).await;
                registry.send_to_user(user, "ping").await;
                registry.remove(user, registration.connection_id).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(registry.total_connections().await, 0);
    }
}
