use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use async_trait::async_trait;
use connector_plugin::{Attributes, Broker, BrokerError, ClientId, TopicEvent};
use dashmap::DashMap;
use tokio::{
    sync::{mpsc, Notify},
    time::{timeout_at, Instant},
};
use tracing::{debug, trace};

/// Published events retained for `published_on`; older ones are dropped.
pub const HISTORY_LIMIT: usize = 256;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Subscription {
    delivery_url: Option<String>,
    buffer: Arc<Mutex<VecDeque<TopicEvent>>>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct Inner {
    subscriptions: DashMap<(ClientId, String), Subscription>,
    sinks: DashMap<String, mpsc::UnboundedSender<TopicEvent>>,
    history: Mutex<VecDeque<TopicEvent>>,
    offline: AtomicBool,
}

/// In-process broker.
///
/// Subscriptions without a delivery URL buffer events for `poll`;
/// subscriptions with one push each event into the sink bound to that URL.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event pushed to `url`. Rebinding replaces the old sink.
    pub fn bind_delivery(&self, url: &str) -> mpsc::UnboundedReceiver<TopicEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.sinks.insert(url.to_string(), tx);
        rx
    }

    /// While offline every operation fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self, client: &str, topic: &str) -> bool {
        self.inner
            .subscriptions
            .contains_key(&(ClientId(client.to_string()), topic.to_string()))
    }

    pub fn delivery_url(&self, client: &str, topic: &str) -> Option<String> {
        self.inner
            .subscriptions
            .get(&(ClientId(client.to_string()), topic.to_string()))
            .and_then(|s| s.delivery_url.clone())
    }

    /// Number of clients subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .iter()
            .filter(|kv| kv.key().1 == topic)
            .count()
    }

    /// Topics `client` is subscribed to, sorted.
    pub fn topics_of(&self, client: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .inner
            .subscriptions
            .iter()
            .filter(|kv| kv.key().0.as_str() == client)
            .map(|kv| kv.key().1.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Attributes of the recent events published on `topic`, oldest first.
    /// Only the last `HISTORY_LIMIT` publishes across all topics are kept.
    pub fn published_on(&self, topic: &str) -> Vec<Attributes> {
        lock(&self.inner.history)
            .iter()
            .filter(|e| e.topic == topic)
            .map(|e| e.attributes.clone())
            .collect()
    }

    fn check_online(&self) -> Result<(), BrokerError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            Err(BrokerError::Transport("broker offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn register_client(&self, name: &str) -> ClientId {
        ClientId(name.to_string())
    }

    async fn remove_client(&self, client: &ClientId) -> Result<(), BrokerError> {
        self.check_online()?;
        self.inner.subscriptions.retain(|(c, _), _| c != client);
        Ok(())
    }

    async fn subscribe(
        &self,
        client: &ClientId,
        topic: &str,
        delivery_url: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.check_online()?;
        let key = (client.clone(), topic.to_string());
        if self.inner.subscriptions.contains_key(&key) {
            return Err(BrokerError::Conflict(topic.to_string()));
        }
        self.inner.subscriptions.insert(
            key,
            Subscription {
                delivery_url: delivery_url.map(str::to_string),
                buffer: Arc::new(Mutex::new(VecDeque::new())),
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    async fn unsubscribe(&self, client: &ClientId, topic: &str) -> Result<(), BrokerError> {
        self.check_online()?;
        match self.inner.subscriptions.remove(&(client.clone(), topic.to_string())) {
            Some(_) => Ok(()),
            None => Err(BrokerError::Conflict(topic.to_string())),
        }
    }

    async fn publish(
        &self,
        client: &ClientId,
        topic: &str,
        attributes: &Attributes,
    ) -> Result<(), BrokerError> {
        self.check_online()?;
        let event = TopicEvent::new(topic, attributes.clone());
        {
            let mut history = lock(&self.inner.history);
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        trace!("{} published on {}: {:?}", client, topic, attributes);

        for kv in self.inner.subscriptions.iter().filter(|kv| kv.key().1 == topic) {
            let sub = kv.value();
            match &sub.delivery_url {
                Some(url) => match self.inner.sinks.get(url) {
                    Some(sink) => {
                        let _ = sink.send(event.clone());
                    }
                    None => debug!("no delivery sink bound for {}", url),
                },
                None => {
                    lock(&sub.buffer).push_back(event.clone());
                    sub.notify.notify_one();
                }
            }
        }
        Ok(())
    }

    async fn poll(
        &self,
        client: &ClientId,
        topic: &str,
        max_wait: Duration,
    ) -> Result<Vec<TopicEvent>, BrokerError> {
        self.check_online()?;
        let (buffer, notify) = match self
            .inner
            .subscriptions
            .get(&(client.clone(), topic.to_string()))
        {
            Some(sub) => (sub.buffer.clone(), sub.notify.clone()),
            None => {
                return Err(BrokerError::NotSubscribed {
                    client: client.to_string(),
                    topic: topic.to_string(),
                });
            }
        };

        let deadline = Instant::now() + max_wait;
        loop {
            {
                let mut pending = lock(&buffer);
                if !pending.is_empty() {
                    return Ok(pending.drain(..).collect());
                }
            }
            if timeout_at(deadline, notify.notified()).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector_plugin::attributes;

    fn client(name: &str) -> ClientId {
        ClientId(name.to_string())
    }

    #[tokio::test]
    async fn test_double_subscribe_conflicts() {
        let broker = InMemoryBroker::new();
        let c = broker.register_client("cs");
        broker.subscribe(&c, "menu", None).await.unwrap();
        let err = broker.subscribe(&c, "menu", None).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(broker.subscriber_count("menu"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_conflicts() {
        let broker = InMemoryBroker::new();
        let err = broker.unsubscribe(&client("cs"), "menu").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_poll_drains_buffer() {
        let broker = InMemoryBroker::new();
        let c = client("cs");
        broker.subscribe(&c, "wall", None).await.unwrap();
        broker
            .publish(&client("other"), "wall", &attributes([("message", "hi")]))
            .await
            .unwrap();

        let events = broker.poll(&c, "wall", Duration::from_millis(10)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attribute("message"), Some("hi"));

        let events = broker.poll(&c, "wall", Duration::from_millis(10)).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let c = client("cs");
        broker.subscribe(&c, "wall", None).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish(&client("x"), "wall", &attributes([("n", "1")]))
                .await
                .unwrap();
        });

        let events = broker.poll(&c, "wall", Duration::from_secs(2)).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_requires_subscription() {
        let broker = InMemoryBroker::new();
        let err = broker
            .poll(&client("cs"), "wall", Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotSubscribed { .. }));
    }

    #[tokio::test]
    async fn test_push_subscription_goes_to_sink() {
        let broker = InMemoryBroker::new();
        let mut rx = broker.bind_delivery("http://cs/ingress");
        let c = client("cs");
        broker.subscribe(&c, "sms", Some("http://cs/ingress")).await.unwrap();
        broker
            .publish(&client("gateway"), "sms", &attributes([("message", "say hi")]))
            .await
            .unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.topic, "sms");
        let polled = broker.poll(&c, "sms", Duration::from_millis(5)).await.unwrap();
        assert!(polled.is_empty());
    }

    #[tokio::test]
    async fn test_offline_fails_everything() {
        let broker = InMemoryBroker::new();
        let c = client("cs");
        broker.subscribe(&c, "wall", None).await.unwrap();
        broker.set_offline(true);
        assert!(matches!(
            broker.poll(&c, "wall", Duration::from_millis(1)).await,
            Err(BrokerError::Transport(_))
        ));
        assert!(broker.subscribe(&c, "menu", None).await.is_err());
        broker.set_offline(false);
        assert!(broker.subscribe(&c, "menu", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let broker = InMemoryBroker::new();
        let c = client("cs");
        broker.subscribe(&c, "t", None).await.unwrap();
        for n in 0..(HISTORY_LIMIT + 500) {
            broker
                .publish(&client("x"), "t", &attributes([("n", n.to_string())]))
                .await
                .unwrap();
            broker.poll(&c, "t", Duration::from_millis(1)).await.unwrap();
        }
        broker.unsubscribe(&c, "t").await.unwrap();

        let kept = broker.published_on("t");
        assert_eq!(kept.len(), HISTORY_LIMIT);
        assert_eq!(kept[0]["n"], "500");
        assert_eq!(kept[HISTORY_LIMIT - 1]["n"], (HISTORY_LIMIT + 499).to_string());
    }

    #[tokio::test]
    async fn test_remove_client_drops_subscriptions() {
        let broker = InMemoryBroker::new();
        let c = client("cs");
        broker.subscribe(&c, "a", None).await.unwrap();
        broker.subscribe(&c, "b", None).await.unwrap();
        broker.subscribe(&client("board"), "a", None).await.unwrap();
        broker.remove_client(&c).await.unwrap();
        assert!(broker.topics_of("cs").is_empty());
        assert_eq!(broker.topics_of("board"), vec!["a".to_string()]);
    }
}
