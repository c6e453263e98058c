use std::{fmt, sync::Arc, time::Duration};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Attributes, TopicEvent};

/// Handle returned by [`Broker::register_client`]. Brokers key
/// subscriptions and event buffers on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors a broker operation can report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker already holds (or never held) the subscription.
    /// Subscription bookkeeping treats this as success.
    #[error("subscription conflict on topic `{0}`")]
    Conflict(String),

    /// Polling a topic the client is not subscribed to.
    #[error("client `{client}` is not subscribed to `{topic}`")]
    NotSubscribed { client: String, topic: String },

    /// Network, protocol or server-side failure.
    #[error("broker transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BrokerError::Conflict(_))
    }
}

/// The capability set consumed from the external pub/sub broker.
///
/// Every call is a single attempt; callers decide how to degrade.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Register (or re-use) a named client.
    fn register_client(&self, name: &str) -> ClientId;

    /// Forget a client and every subscription it holds.
    async fn remove_client(&self, client: &ClientId) -> Result<(), BrokerError>;

    /// Subscribe `client` to `topic`. With a delivery URL, events are pushed
    /// to that URL instead of being buffered for [`Broker::poll`].
    async fn subscribe(
        &self,
        client: &ClientId,
        topic: &str,
        delivery_url: Option<&str>,
    ) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, client: &ClientId, topic: &str) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        client: &ClientId,
        topic: &str,
        attributes: &Attributes,
    ) -> Result<(), BrokerError>;

    /// Wait at most `max_wait` for buffered events on `topic`.
    async fn poll(
        &self,
        client: &ClientId,
        topic: &str,
        max_wait: Duration,
    ) -> Result<Vec<TopicEvent>, BrokerError>;
}

pub type SharedBroker = Arc<dyn Broker>;
