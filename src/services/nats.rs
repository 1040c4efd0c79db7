//! NATS-backed [`Backplane`] for running several hub instances side by side.
//!
//! Core NATS (no JetStream): fire-and-forget publish, at-most-once delivery.
//! The excluded user travels in the `Exclude-Client` header; a missing or
//! zero header excludes nobody.

use std::time::Duration;

use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::backplane::{Backplane, BackplaneError, BusMessage, Subscription};
use crate::state::UserId;

pub const EXCLUDE_CLIENT_HEADER: &str = "Exclude-Client";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_WAIT: Duration = Duration::from_secs(3);

pub struct NatsBackplane {
    client: async_nats::Client,
}

impl NatsBackplane {
    /// Connect to the NATS server at `url`.
    ///
    /// An unreachable server is not fatal: the client keeps retrying every
    /// three seconds, forever, and publishes queue until it is back.
    ///
    /// # Errors
    ///
    /// Returns [`BackplaneError::Connect`] if `url` is not a valid server address.
    pub async fn connect(url: &str) -> Result<Self, BackplaneError> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(CONNECT_TIMEOUT)
            .retry_on_initial_connect()
            .max_reconnects(None::<usize>)
            .reconnect_delay_callback(|_attempts| RECONNECT_WAIT)
            .event_callback(|event| async move {
                info!(%event, "backplane: nats connection event");
            })
            .connect(url)
            .await
            .map_err(|e| BackplaneError::Connect(e.to_string()))?;
        info!(%url, "backplane: connected to nats");
        Ok(Self { client })
    }
}

/// Header value for an exclusion, `None` when nobody is excluded.
#[must_use]
pub fn exclude_header_value(exclude_user: Option<UserId>) -> Option<String> {
    exclude_user.filter(|id| *id != 0).map(|id| id.to_string())
}

/// Parse the exclusion header. Absent, zero, or unparsable values exclude nobody.
#[must_use]
pub fn parse_exclude_header(raw: Option<&str>) -> Option<UserId> {
    raw.and_then(|v| v.trim().parse::<UserId>().ok())
        .filter(|id| *id != 0)
}

#[async_trait]
impl Backplane for NatsBackplane {
    async fn publish(&self, topic: &str, payload: Bytes, exclude_user: Option<UserId>) -> Result<(), BackplaneError> {
        let mut headers = HeaderMap::new();
        if let Some(value) = exclude_header_value(exclude_user) {
            headers.insert(EXCLUDE_CLIENT_HEADER, value.as_str());
        }

        self.client
            .publish_with_headers(topic.to_owned(), headers, payload)
            .await
            .map_err(|e| BackplaneError::Publish { topic: topic.to_owned(), reason: e.to_string() })
    }

    async fn subscribe(&self, topic: &str, sink: mpsc::Sender<BusMessage>) -> Result<Subscription, BackplaneError> {
        let mut subscriber = self
            .client
            .subscribe(topic.to_owned())
            .await
            .map_err(|e| BackplaneError::Subscribe { topic: topic.to_owned(), reason: e.to_string() })?;

        let task_topic = topic.to_owned();
        let task = tokio::spawn(async move {
            // Dropping `subscriber` (task end or abort) unsubscribes on the server.
            while let Some(msg) = subscriber.next().await {
                let exclude_user = parse_exclude_header(
                    msg.headers
                        .as_ref()
                        .and_then(|h| h.get(EXCLUDE_CLIENT_HEADER))
                        .map(|v| v.as_str()),
                );
                let bus_msg = BusMessage { topic: msg.subject.to_string(), payload: msg.payload, exclude_user };
                if sink.send(bus_msg).await.is_err() {
                    break;
                }
            }
            warn!(topic = %task_topic, "backplane: nats subscription ended");
        });

        Ok(Subscription::new(topic.to_owned(), task))
    }
}
