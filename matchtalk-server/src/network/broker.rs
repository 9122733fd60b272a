//! Subscription Broker
//!
//! Tracks open realtime connections, the principal bound to each and their
//! subscriptions. Deliveries are collected under the read lock and sent after
//! it is released.
//!
//! Delivery never waits on a connection's outbound buffer. A connection whose
//! buffer is full is a slow consumer: it stops receiving deliveries and its
//! eviction signal fires so the connection task closes it.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, warn};

use super::protocol::ServerFrame;
use crate::auth::frame::ConnectionId;

/// Outbound channel depth per connection.
pub const CONNECTION_BUFFER: usize = 64;

struct Connection {
    /// Login id, once CONNECT succeeded.
    principal: Option<String>,
    /// Frames to the connection's writer task.
    sender: mpsc::Sender<ServerFrame>,
    /// subscription id -> destination.
    subscriptions: BTreeMap<String, String>,
    /// Set once the connection fell behind.
    evicted: bool,
    /// Fired on eviction.
    evict: Arc<Notify>,
}

struct Target {
    connection: ConnectionId,
    subscription: String,
    sender: mpsc::Sender<ServerFrame>,
}

/// Connection registry and fan-out.
#[derive(Default)]
pub struct Broker {
    next_id: AtomicU64,
    connections: RwLock<BTreeMap<ConnectionId, Connection>>,
}

impl Broker {
    /// Empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Track a new, not yet authenticated connection. The returned signal
    /// fires if the broker evicts the connection as a slow consumer.
    pub async fn register(&self, id: ConnectionId, sender: mpsc::Sender<ServerFrame>) -> Arc<Notify> {
        let evict = Arc::new(Notify::new());
        self.connections.write().await.insert(
            id,
            Connection {
                principal: None,
                sender,
                subscriptions: BTreeMap::new(),
                evicted: false,
                evict: evict.clone(),
            },
        );
        evict
    }

    /// Record the principal a connection authenticated as.
    pub async fn bind_principal(&self, id: ConnectionId, user: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(&id) {
            conn.principal = Some(user.to_string());
        }
    }

    /// Forget a connection. Returns its principal and whether that principal
    /// still has other connections open.
    pub async fn unregister(&self, id: ConnectionId) -> Option<(String, bool)> {
        let mut connections = self.connections.write().await;
        let user = connections.remove(&id)?.principal?;
        let still_connected = connections
            .values()
            .any(|c| c.principal.as_deref() == Some(user.as_str()));
        Some((user, still_connected))
    }

    /// Add a subscription. An existing subscription id is replaced.
    pub async fn subscribe(&self, id: ConnectionId, subscription: &str, destination: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(&id) {
            conn.subscriptions
                .insert(subscription.to_string(), destination.to_string());
        }
    }

    /// Remove a subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, id: ConnectionId, subscription: &str) -> bool {
        self.connections
            .write()
            .await
            .get_mut(&id)
            .is_some_and(|conn| conn.subscriptions.remove(subscription).is_some())
    }

    /// Deliver `body` to every subscriber of `destination`. Returns the
    /// number of deliveries.
    pub async fn publish(&self, destination: &str, body: Value) -> usize {
        let targets = self.collect(|_| true, destination).await;
        self.deliver(targets, destination, body).await
    }

    /// Deliver `body` to `user`'s private `queue` on every connection of
    /// theirs that subscribed to it.
    pub async fn send_to_user(&self, user: &str, queue: &str, body: Value) -> usize {
        let targets = self
            .collect(|conn| conn.principal.as_deref() == Some(user), queue)
            .await;
        let delivered = self.deliver(targets, queue, body).await;
        if delivered == 0 {
            debug!("No subscriber for {} on {}", user, queue);
        }
        delivered
    }

    /// Whether `user` has an authenticated connection open.
    pub async fn is_online(&self, user: &str) -> bool {
        self.connections
            .read()
            .await
            .values()
            .any(|c| c.principal.as_deref() == Some(user))
    }

    /// Open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn collect<F>(&self, filter: F, destination: &str) -> Vec<Target>
    where
        F: Fn(&Connection) -> bool,
    {
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|(_, conn)| !conn.evicted && filter(conn))
            .flat_map(|(id, conn)| {
                conn.subscriptions
                    .iter()
                    .filter(|(_, dest)| dest.as_str() == destination)
                    .map(move |(sub, _)| Target {
                        connection: *id,
                        subscription: sub.clone(),
                        sender: conn.sender.clone(),
                    })
            })
            .collect()
    }

    async fn deliver(&self, targets: Vec<Target>, destination: &str, body: Value) -> usize {
        let mut delivered = 0;
        let mut slow = Vec::new();
        for target in targets {
            let frame = ServerFrame::Message {
                subscription: target.subscription,
                destination: destination.to_string(),
                body: body.clone(),
            };
            match target.sender.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Connection {} is not draining its buffer; dropping delivery to {} and evicting",
                        target.connection, destination
                    );
                    slow.push(target.connection);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        if !slow.is_empty() {
            self.evict(&slow).await;
        }
        delivered
    }

    async fn evict(&self, ids: &[ConnectionId]) {
        let mut connections = self.connections.write().await;
        for id in ids {
            if let Some(conn) = connections.get_mut(id) {
                if !conn.evicted {
                    conn.evicted = true;
                    conn.evict.notify_one();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn connection(broker: &Broker, user: Option<&str>) -> (ConnectionId, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        let id = broker.next_connection_id();
        broker.register(id, tx).await;
        if let Some(user) = user {
            broker.bind_principal(id, user).await;
        }
        (id, rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_only() {
        let broker = Broker::new();
        let (a, mut rx_a) = connection(&broker, Some("alice")).await;
        let (_b, mut rx_b) = connection(&broker, Some("bob")).await;
        broker.subscribe(a, "sub-1", "/topic/rooms/1").await;

        assert_eq!(broker.publish("/topic/rooms/1", json!({"x": 1})).await, 1);
        match rx_a.recv().await.unwrap() {
            ServerFrame::Message { subscription, body, .. } => {
                assert_eq!(subscription, "sub-1");
                assert_eq!(body["x"], 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());

        assert!(broker.unsubscribe(a, "sub-1").await);
        assert_eq!(broker.publish("/topic/rooms/1", json!({})).await, 0);
    }

    #[tokio::test]
    async fn test_private_queue_goes_to_owner() {
        let broker = Broker::new();
        let (a1, mut rx_a1) = connection(&broker, Some("alice")).await;
        let (a2, mut rx_a2) = connection(&broker, Some("alice")).await;
        let (b, mut rx_b) = connection(&broker, Some("bob")).await;
        for id in [a1, a2, b] {
            broker.subscribe(id, "q", "/user/queue/signals").await;
        }

        assert_eq!(broker.send_to_user("alice", "/user/queue/signals", json!("hi")).await, 2);
        assert!(rx_a1.recv().await.is_some());
        assert!(rx_a2.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
        assert_eq!(broker.send_to_user("carol", "/user/queue/signals", json!("hi")).await, 0);
    }

    #[tokio::test]
    async fn test_unregister_reports_remaining_connections() {
        let broker = Broker::new();
        let (a1, _rx1) = connection(&broker, Some("alice")).await;
        let (a2, _rx2) = connection(&broker, Some("alice")).await;
        let (anon, _rx3) = connection(&broker, None).await;

        assert_eq!(broker.unregister(a1).await, Some(("alice".into(), true)));
        assert_eq!(broker.unregister(a2).await, Some(("alice".into(), false)));
        assert_eq!(broker.unregister(anon).await, None);
        assert!(!broker.is_online("alice").await);
        assert_eq!(broker.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted_without_blocking() {
        let broker = Broker::new();
        let (tx, _undrained) = mpsc::channel(CONNECTION_BUFFER);
        let slow = broker.next_connection_id();
        let evicted = broker.register(slow, tx).await;
        broker.bind_principal(slow, "slow").await;
        broker.subscribe(slow, "m", "/user/queue/match-results").await;
        let (fast, mut rx_fast) = connection(&broker, Some("fast")).await;
        broker.subscribe(fast, "r", "/topic/rooms/1").await;
        broker.subscribe(slow, "r", "/topic/rooms/1").await;

        for _ in 0..CONNECTION_BUFFER {
            assert_eq!(broker.send_to_user("slow", "/user/queue/match-results", json!({})).await, 1);
        }

        let overflow = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            broker.send_to_user("slow", "/user/queue/match-results", json!({})),
        )
        .await
        .expect("delivery blocked on a full buffer");
        assert_eq!(overflow, 0);
        tokio::time::timeout(std::time::Duration::from_secs(2), evicted.notified())
            .await
            .expect("slow consumer was not signalled");

        // evicted connections are skipped, others still receive
        assert_eq!(broker.publish("/topic/rooms/1", json!({"x": 1})).await, 1);
        assert!(rx_fast.recv().await.is_some());
    }
}
