use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    broker::{Broker, BrokerError},
    message::{Attributes, TopicEvent},
};

type RetireHook = Pin<Box<dyn Future<Output = ()> + Send>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes into the topic of whichever application is currently on screen.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, attributes: Attributes) -> Result<(), BrokerError>;
}

/// The one trait connector authors implement.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Identifier this connector was registered under.
    fn name(&self) -> String;

    /// Called with text traffic the router could not interpret itself
    /// (SMS/social messages without a keyword, direct posts).
    /// Implementations are expected to publish to the broker here,
    /// otherwise the application looks idle to the orchestrator.
    async fn send_event(&self, attributes: Attributes) -> Result<(), ConnectorError>;

    /// Called with every event delivered on the application's own topic.
    async fn receive_event(&self, event: TopicEvent) -> Result<(), ConnectorError>;
}

/// Builds connectors for one identifier.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn create(&self, ctx: ConnectorContext) -> Result<Arc<dyn Connector>, ConnectorError>;
}

/// Errors that a connector or its factory can return.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// No factory registered under this identifier.
    #[error("unknown connector `{0}`")]
    Unknown(String),

    /// The factory failed while building the connector.
    #[error("could not construct connector `{name}`: {reason}")]
    Construction { name: String, reason: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("connector error: {0}")]
    Other(String),
}

/// Everything a factory needs to build a connector for one application.
///
/// Background work must be started through [`ConnectorContext::spawn_listener`]
/// so the dispatcher can stop it before the next connector is created.
#[derive(Clone)]
pub struct ConnectorContext {
    pub app_id: String,
    pub topic: String,
    pub parameters: BTreeMap<String, String>,
    pub broker: Arc<dyn Broker>,
    pub publisher: Arc<dyn EventPublisher>,
    cancel: CancellationToken,
    listeners: Arc<Mutex<Vec<JoinHandle<()>>>>,
    hooks: Arc<Mutex<Vec<RetireHook>>>,
}

impl ConnectorContext {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Token cancelled when the connector is retired.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a background listener that ends when the connector is retired.
    pub fn spawn_listener<F>(&self, name: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancel.clone();
        let label = format!("{}/{}", self.app_id, name);
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!("listener `{}` cancelled", label),
                _ = fut => debug!("listener `{}` finished", label),
            }
        });
        lock(&self.listeners).push(handle);
    }

    /// Run `fut` once the listeners have stopped, e.g. to unsubscribe
    /// topics the connector took.
    pub fn on_retire<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        lock(&self.hooks).push(Box::pin(fut));
    }
}

/// Owner side of a [`ConnectorContext`]: cancels and reaps its listeners.
#[derive(Default)]
pub struct ConnectorLease {
    cancel: CancellationToken,
    listeners: Arc<Mutex<Vec<JoinHandle<()>>>>,
    hooks: Arc<Mutex<Vec<RetireHook>>>,
}

impl std::fmt::Debug for ConnectorLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorLease")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("listeners", &lock(&self.listeners).len())
            .field("hooks", &lock(&self.hooks).len())
            .finish()
    }
}

impl ConnectorLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(
        &self,
        app_id: impl Into<String>,
        topic: impl Into<String>,
        parameters: BTreeMap<String, String>,
        broker: Arc<dyn Broker>,
        publisher: Arc<dyn EventPublisher>,
    ) -> ConnectorContext {
        ConnectorContext {
            app_id: app_id.into(),
            topic: topic.into(),
            parameters,
            broker,
            publisher,
            cancel: self.cancel.clone(),
            listeners: self.listeners.clone(),
            hooks: self.hooks.clone(),
        }
    }

    pub fn active_listeners(&self) -> usize {
        lock(&self.listeners).iter().filter(|h| !h.is_finished()).count()
    }

    pub fn is_retired(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every listener and wait up to `grace` for each to end;
    /// stragglers are aborted. Retire hooks run afterwards, each bounded
    /// by `grace` as well. Calling this twice is harmless.
    pub async fn retire(&self, grace: Duration) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = lock(&self.listeners).drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("connector listener did not stop within {:?}, aborting", grace);
                handle.abort();
            }
        }
        let hooks: Vec<RetireHook> = lock(&self.hooks).drain(..).collect();
        for hook in hooks {
            if tokio::time::timeout(grace, hook).await.is_err() {
                warn!("connector retire hook did not finish within {:?}", grace);
            }
        }
    }
}
