//! Backplane — topic pub/sub that carries board events between hub instances.
//!
//! ARCHITECTURE
//! ============
//! Every hub instance subscribes to `board.<slug>` while it has at least one
//! local member on that board. A publish reaches every subscribed instance,
//! including the publisher's own, so local and remote members are served by
//! the same delivery path.
//!
//! Messages carry an optional excluded user id. Each subscriber filters its
//! own members against it, which gives self-echo avoidance without the bus
//! knowing anything about connections.
//!
//! Two implementations: [`MemoryBackplane`] for a single process and tests,
//! and `NatsBackplane` (see `services::nats`) for multi-instance deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state::UserId;

pub const TOPIC_PREFIX: &str = "board.";

const MEMORY_TOPIC_CAPACITY: usize = 1024;

#[must_use]
pub fn board_topic(board_id: &str) -> String {
    format!("{TOPIC_PREFIX}{board_id}")
}

/// Inverse of [`board_topic`]. `None` for topics outside the board namespace.
#[must_use]
pub fn board_from_topic(topic: &str) -> Option<&str> {
    topic.strip_prefix(TOPIC_PREFIX).filter(|id| !id.is_empty())
}

// =============================================================================
// TYPES
// =============================================================================

/// One event as it travels on the bus. `payload` is an already-encoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Members bound to this user must not receive the message.
    pub exclude_user: Option<UserId>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    #[error("backplane connect failed: {0}")]
    Connect(String),
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// Live subscription. Received messages are forwarded by `task` until the
/// subscription is cancelled.
pub struct Subscription {
    topic: String,
    task: JoinHandle<()>,
}

impl Subscription {
    #[must_use]
    pub fn new(topic: String, task: JoinHandle<()>) -> Self {
        Self { topic, task }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop forwarding and wait until the underlying bus subscription is dropped.
    pub async fn cancel(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Pub/sub capability used by the hub.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Publish `payload` on `topic`. `exclude_user` of `None` excludes nobody.
    async fn publish(&self, topic: &str, payload: Bytes, exclude_user: Option<UserId>) -> Result<(), BackplaneError>;

    /// Start forwarding every message on `topic` into `sink`.
    async fn subscribe(&self, topic: &str, sink: mpsc::Sender<BusMessage>) -> Result<Subscription, BackplaneError>;

    /// Tear a subscription down.
    async fn unsubscribe(&self, subscription: Subscription) {
        debug!(topic = %subscription.topic(), "backplane: unsubscribe");
        subscription.cancel().await;
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Process-local bus. Sharing one instance between several hubs simulates a
/// multi-instance deployment.
#[derive(Default)]
pub struct MemoryBackplane {
    topics: Mutex<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl MemoryBackplane {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic`.
    #[cfg(test)]
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock_topics()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<BusMessage>>> {
        self.topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn publish(&self, topic: &str, payload: Bytes, exclude_user: Option<UserId>) -> Result<(), BackplaneError> {
        let topics = self.lock_topics();
        let Some(tx) = topics.get(topic) else {
            return Ok(());
        };
        // No receivers is not an error: nobody is listening, same as a real bus.
        let _ = tx.send(BusMessage { topic: topic.to_owned(), payload, exclude_user });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, sink: mpsc::Sender<BusMessage>) -> Result<Subscription, BackplaneError> {
        let mut rx = self
            .lock_topics()
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(MEMORY_TOPIC_CAPACITY).0)
            .subscribe();

        let task_topic = topic.to_owned();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %task_topic, skipped, "backplane: subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(topic.to_owned(), task))
    }
}

/// Shared handle type used by the hub.
pub type SharedBackplane = Arc<dyn Backplane>;

#[cfg(test)]
#[path = "backplane_test.rs"]
mod tests;
