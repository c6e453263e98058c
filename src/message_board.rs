use std::{sync::Arc, time::Duration};
use connector_plugin::{Attributes, Broker, BrokerError, TopicEvent};
use tracing::{error, info};

use crate::subscription::SubscriptionManager;

pub const ANONYMOUS: &str = "Anonymous";

/// The public message wall. Runs on its own broker client and topic,
/// independent of whichever application is on screen.
#[derive(Debug, Clone)]
pub struct MessageBoard {
    topic: String,
    subscriptions: SubscriptionManager,
}

impl MessageBoard {
    pub fn new(broker: Arc<dyn Broker>, client_name: &str, topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            subscriptions: SubscriptionManager::new(broker, client_name),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn subscribe(&self) {
        self.subscriptions.subscribe(&self.topic, None).await;
    }

    pub async fn unsubscribe(&self) {
        self.subscriptions.unsubscribe(&self.topic).await;
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscriptions.is_active(&self.topic)
    }

    /// Post a message. A missing or blank `name` becomes "Anonymous".
    pub async fn push(&self, mut attributes: Attributes) -> Result<(), BrokerError> {
        let anonymous = attributes
            .get("name")
            .map(|n| n.trim().is_empty())
            .unwrap_or(true);
        if anonymous {
            attributes.insert("name".to_string(), ANONYMOUS.to_string());
        }
        self.subscriptions.publish(&self.topic, &attributes).await?;
        info!("Message board post from {}", attributes["name"]);
        Ok(())
    }

    /// Messages that arrived since the last pull, waiting at most `max_wait`.
    /// Never fails: transport errors are logged and read as "nothing new".
    pub async fn pull(&self, max_wait: Duration) -> Vec<TopicEvent> {
        match self.subscriptions.poll(&self.topic, max_wait).await {
            Ok(events) => events,
            Err(e) => {
                error!("Could not receive message board events: {}", e);
                Vec::new()
            }
        }
    }
}
