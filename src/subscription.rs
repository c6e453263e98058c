use std::{sync::Arc, time::Duration};
use connector_plugin::{Attributes, Broker, BrokerError, ClientId, TopicEvent};
use dashmap::DashMap;
use tracing::{info, warn};

/// Idempotent subscription bookkeeping for one broker client.
///
/// Broker failures never surface from `subscribe`/`unsubscribe`: a conflict
/// means the broker already agrees with us, anything else is logged and the
/// caller carries on with possibly degraded delivery.
#[derive(Clone)]
pub struct SubscriptionManager {
    broker: Arc<dyn Broker>,
    client: ClientId,
    active: Arc<DashMap<String, Option<String>>>,
}

impl SubscriptionManager {
    pub fn new(broker: Arc<dyn Broker>, client_name: &str) -> Self {
        let client = broker.register_client(client_name);
        Self {
            broker,
            client,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub async fn subscribe(&self, topic: &str, delivery_url: Option<&str>) {
        match self.broker.subscribe(&self.client, topic, delivery_url).await {
            Ok(()) => match delivery_url {
                Some(url) => info!("Subscribed to {} with delivery to {}", topic, url),
                None => info!("Subscribed to {}", topic),
            },
            Err(BrokerError::Conflict(_)) => {
                warn!("Already subscribed to broker topic {}", topic);
            }
            Err(e) => {
                warn!("Could not subscribe to broker topic {}: {}", topic, e);
            }
        }
        self.active
            .insert(topic.to_string(), delivery_url.map(str::to_string));
    }

    pub async fn unsubscribe(&self, topic: &str) {
        match self.broker.unsubscribe(&self.client, topic).await {
            Ok(()) => info!("Unsubscribed from {}", topic),
            Err(BrokerError::Conflict(_)) => {
                warn!("Already unsubscribed from broker topic {}", topic);
            }
            Err(e) => {
                warn!("Could not unsubscribe from broker topic {}: {}", topic, e);
            }
        }
        self.active.remove(topic);
    }

    /// Unsubscribe every topic this manager believes it holds.
    pub async fn unsubscribe_all(&self) {
        for topic in self.active_topics() {
            self.unsubscribe(&topic).await;
        }
    }

    pub fn is_active(&self, topic: &str) -> bool {
        self.active.contains_key(topic)
    }

    /// Sorted list of topics currently held.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.active.iter().map(|kv| kv.key().clone()).collect();
        topics.sort();
        topics
    }

    pub async fn publish(&self, topic: &str, attributes: &Attributes) -> Result<(), BrokerError> {
        self.broker.publish(&self.client, topic, attributes).await
    }

    pub async fn poll(
        &self,
        topic: &str,
        max_wait: Duration,
    ) -> Result<Vec<TopicEvent>, BrokerError> {
        self.broker.poll(&self.client, topic, max_wait).await
    }

    /// Drop the client on the broker side.
    pub async fn release(&self) {
        if let Err(e) = self.broker.remove_client(&self.client).await {
            warn!("Could not remove broker client {}: {}", self.client, e);
        }
        self.active.clear();
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("client", &self.client)
            .field("active", &self.active_topics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    fn manager() -> (InMemoryBroker, SubscriptionManager) {
        let broker = InMemoryBroker::new();
        let subs = SubscriptionManager::new(Arc::new(broker.clone()), "coffeeshop");
        (broker, subs)
    }

    #[tokio::test]
    async fn test_subscribe_twice_is_one_subscription() {
        let (broker, subs) = manager();
        subs.subscribe("menu", Some("http://cs/ingress")).await;
        subs.subscribe("menu", Some("http://cs/ingress")).await;

        assert_eq!(broker.subscriber_count("menu"), 1);
        assert_eq!(subs.active_topics(), vec!["menu".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_quiet() {
        let (broker, subs) = manager();
        subs.subscribe("menu", None).await;
        subs.unsubscribe("menu").await;
        subs.unsubscribe("menu").await;

        assert!(!broker.is_subscribed("coffeeshop", "menu"));
        assert!(!subs.is_active("menu"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_soft() {
        let (broker, subs) = manager();
        broker.set_offline(true);
        subs.subscribe("sms", None).await;
        assert!(subs.is_active("sms"));
        assert!(!broker.is_subscribed("coffeeshop", "sms"));

        broker.set_offline(false);
        subs.unsubscribe("sms").await;
        assert!(subs.active_topics().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let (broker, subs) = manager();
        for topic in ["menu", "sms", "osn"] {
            subs.subscribe(topic, None).await;
        }
        subs.unsubscribe_all().await;
        assert!(broker.topics_of("coffeeshop").is_empty());
        assert!(subs.active_topics().is_empty());
    }
}
