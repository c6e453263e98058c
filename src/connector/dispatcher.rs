// src/connector/dispatcher.rs

use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use connector_plugin::{
    Attributes, Broker, Connector, ConnectorLease, EventPublisher, TopicEvent,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    catalog::AppDescriptor,
    connector::{builtin::NoopConnector, registry::ConnectorRegistry},
};

/// How long a retired connector's listeners get to stop before being aborted.
pub const RETIRE_GRACE: Duration = Duration::from_secs(2);

struct ActiveConnector {
    identifier: String,
    app_id: String,
    connector: Arc<dyn Connector>,
    lease: ConnectorLease,
}

impl ActiveConnector {
    fn serves(&self, app: &AppDescriptor) -> bool {
        self.identifier == app.connector() && self.app_id == app.id
    }
}

/// Routes traffic to the connector of the application on screen.
///
/// One connector instance is cached at a time, keyed by connector identifier
/// and application id: connectors are built from the application's topic and
/// parameters, so two applications sharing an identifier each get their own
/// instance. Construction failures are
/// isolated: the dispatcher logs them and serves a no-op connector instead.
pub struct ConnectorDispatcher {
    registry: ConnectorRegistry,
    broker: Arc<dyn Broker>,
    publisher: Arc<dyn EventPublisher>,
    context: watch::Receiver<Arc<AppDescriptor>>,
    active: Mutex<Option<ActiveConnector>>,
    grace: Duration,
}

impl ConnectorDispatcher {
    pub fn new(
        registry: ConnectorRegistry,
        broker: Arc<dyn Broker>,
        publisher: Arc<dyn EventPublisher>,
        context: watch::Receiver<Arc<AppDescriptor>>,
    ) -> Self {
        Self {
            registry,
            broker,
            publisher,
            context,
            active: Mutex::new(None),
            grace: RETIRE_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Identifier and application of the cached connector, if any.
    pub async fn active(&self) -> Option<(String, String)> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| (a.identifier.clone(), a.app_id.clone()))
    }

    /// Background listeners currently owned by the cached connector.
    pub async fn active_listeners(&self) -> usize {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.lease.active_listeners())
            .unwrap_or(0)
    }

    /// The connector for the current context, built on first use.
    pub async fn ensure(&self) -> Arc<dyn Connector> {
        let app = self.context.borrow().clone();
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if current.serves(&app) {
                return current.connector.clone();
            }
        }
        if let Some(previous) = active.take() {
            debug!(
                "Retiring connector `{}` of {} before building the next one",
                previous.identifier, previous.app_id
            );
            previous.lease.retire(self.grace).await;
        }

        let lease = ConnectorLease::new();
        let ctx = lease.context(
            app.id.clone(),
            app.topic(),
            app.parameter_map(),
            self.broker.clone(),
            self.publisher.clone(),
        );
        let connector: Arc<dyn Connector> = match self.registry.create(app.connector(), ctx).await {
            Ok(connector) => {
                info!("Connector `{}` ready for {}", app.connector(), app.id);
                connector
            }
            Err(e) => {
                error!(
                    "Could not create connector `{}` for {}: {}; using no-op connector",
                    app.connector(),
                    app.id,
                    e
                );
                lease.retire(self.grace).await;
                Arc::new(NoopConnector)
            }
        };

        *active = Some(ActiveConnector {
            identifier: app.connector().to_string(),
            app_id: app.id.clone(),
            connector: connector.clone(),
            lease,
        });
        connector
    }

    /// Hand text traffic to the active connector. Failures are logged only.
    pub async fn send_event(&self, attributes: Attributes) {
        let connector = self.ensure().await;
        if let Err(e) = connector.send_event(attributes).await {
            warn!("Connector `{}` failed to send: {}", connector.name(), e);
        }
    }

    /// Hand an application-topic event to the active connector.
    pub async fn receive_event(&self, event: TopicEvent) {
        let connector = self.ensure().await;
        if let Err(e) = connector.receive_event(event).await {
            warn!("Connector `{}` failed to receive: {}", connector.name(), e);
        }
    }

    /// Retire the cached connector if it no longer serves `app`.
    pub async fn retire_stale(&self, app: &AppDescriptor) {
        let mut active = self.active.lock().await;
        let stale = active.as_ref().map(|a| !a.serves(app)).unwrap_or(false);
        if stale {
            if let Some(previous) = active.take() {
                info!(
                    "Context moved to {}; retiring connector `{}` of {}",
                    app.id, previous.identifier, previous.app_id
                );
                previous.lease.retire(self.grace).await;
            }
        }
    }

    /// Follow context changes and retire connectors as soon as their
    /// application leaves the screen. Ends when the context sender or the
    /// dispatcher goes away.
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.context.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let app = rx.borrow_and_update().clone();
                let Some(dispatcher) = weak.upgrade() else {
                    break;
                };
                dispatcher.retire_stale(&app).await;
            }
            debug!("connector supervisor stopped");
        })
    }

    /// Retire whatever is cached.
    pub async fn shutdown(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            previous.lease.retire(self.grace).await;
            info!("Connector `{}` retired on shutdown", previous.identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::InMemoryBroker,
        catalog::{Parameter, tests::app},
    };
    use async_trait::async_trait;
    use connector_plugin::{
        BrokerError, ConnectorContext, ConnectorError, ConnectorFactory, attributes,
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };

    #[derive(Default)]
    struct Recorder {
        published: StdMutex<Vec<Attributes>>,
    }

    #[async_trait]
    impl EventPublisher for Recorder {
        async fn publish_event(&self, attributes: Attributes) -> Result<(), BrokerError> {
            self.published.lock().unwrap().push(attributes);
            Ok(())
        }
    }

    struct Counting {
        built: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectorFactory for Counting {
        async fn create(
            &self,
            ctx: ConnectorContext,
        ) -> Result<Arc<dyn Connector>, ConnectorError> {
            self.built.fetch_add(1, Ordering::SeqCst);
            ctx.spawn_listener("idle", std::future::pending());
            Ok(Arc::new(NoopConnector))
        }
    }

    struct Failing;

    #[async_trait]
    impl ConnectorFactory for Failing {
        async fn create(&self, _: ConnectorContext) -> Result<Arc<dyn Connector>, ConnectorError> {
            Err(ConnectorError::Construction {
                name: "failing".into(),
                reason: "boom".into(),
            })
        }
    }

    fn dispatcher(
        initial: AppDescriptor,
    ) -> (
        Arc<ConnectorDispatcher>,
        watch::Sender<Arc<AppDescriptor>>,
        Arc<Recorder>,
        Arc<AtomicUsize>,
    ) {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = ConnectorRegistry::with_builtin();
        registry.register("counting", Arc::new(Counting { built: built.clone() }));
        registry.register("failing", Arc::new(Failing));
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = watch::channel(Arc::new(initial));
        let dispatcher = ConnectorDispatcher::new(
            registry,
            Arc::new(InMemoryBroker::new()),
            recorder.clone(),
            rx,
        )
        .with_grace(Duration::from_millis(100));
        (Arc::new(dispatcher), tx, recorder, built)
    }

    #[tokio::test]
    async fn test_pass_through_send_publishes() {
        let (dispatcher, _tx, recorder, _) = dispatcher(app("wall", "default", 30));
        dispatcher.send_event(attributes([("message", "foobar baz")])).await;
        assert_eq!(recorder.published.lock().unwrap()[0]["message"], "foobar baz");
        assert_eq!(
            dispatcher.active().await,
            Some(("default".to_string(), "wall".to_string()))
        );
    }

    #[tokio::test]
    async fn test_connector_is_cached() {
        let (dispatcher, _tx, _, built) = dispatcher(app("quiz", "counting", 30));
        for _ in 0..3 {
            dispatcher
                .receive_event(TopicEvent::new("quiz_topic", Attributes::new()))
                .await;
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.active_listeners().await, 1);
    }

    #[tokio::test]
    async fn test_shared_identifier_rebuilds_per_application() {
        let (dispatcher, tx, _, built) = dispatcher(app("quiz", "counting", 30));
        dispatcher.ensure().await;

        tx.send(Arc::new(app("trivia", "counting", 30))).unwrap();
        dispatcher.ensure().await;
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(
            dispatcher.active().await,
            Some(("counting".to_string(), "trivia".to_string()))
        );
        assert_eq!(dispatcher.active_listeners().await, 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_and_failing_fall_back_to_noop() {
        let (dispatcher, tx, recorder, _) = dispatcher(app("eye", "eyeballing", 30));
        dispatcher.send_event(attributes([("message", "hi")])).await;
        assert_eq!(dispatcher.ensure().await.name(), "noop");

        tx.send(Arc::new(app("bad", "failing", 30))).unwrap();
        dispatcher.send_event(attributes([("message", "hi")])).await;
        assert_eq!(dispatcher.ensure().await.name(), "noop");
        assert!(recorder.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_switch_retires_previous_listeners() {
        let (dispatcher, tx, _, built) = dispatcher(app("quiz", "counting", 30));
        dispatcher.ensure().await;
        assert_eq!(dispatcher.active_listeners().await, 1);

        let supervisor = dispatcher.spawn_supervisor();
        tx.send(Arc::new(app("wall", "default", 30))).unwrap();
        for _ in 0..50 {
            if dispatcher.active().await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dispatcher.active().await.is_none());

        let mut other = app("poll", "counting", 30);
        other.parameters.push(Parameter {
            name: "mode".into(),
            value: "fast".into(),
        });
        tx.send(Arc::new(other)).unwrap();
        dispatcher.ensure().await;
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.active_listeners().await, 1);

        dispatcher.shutdown().await;
        assert!(dispatcher.active().await.is_none());
        drop(tx);
        supervisor.await.unwrap();
    }
}
