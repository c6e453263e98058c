// src/apps.rs
use std::{path::PathBuf, sync::Arc, time::Duration};
use anyhow::{Context, Result};
use axum::Router;
use connector_plugin::{Broker, EventPublisher};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    broker::InMemoryBroker,
    catalog::CatalogLoader,
    config::Settings,
    connector::{ConnectorDispatcher, ConnectorRegistry},
    http::{self, HttpState},
    orchestrator::Orchestrator,
    router::MessageRouter,
    watcher::{CatalogWatch, DirectoryWatcher},
};

const CATALOG_POLL: Duration = Duration::from_secs(2);
const CATALOG_SETTLE: Duration = Duration::from_millis(500);

/// Everything one container runs, wired together.
pub struct CoffeeShopApp {
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<ConnectorDispatcher>,
    router: MessageRouter,
    stop: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    delivery_pump: Option<JoinHandle<()>>,
    server: Option<JoinHandle<()>>,
    watcher: Option<DirectoryWatcher>,
}

impl CoffeeShopApp {
    /// Start the orchestrator and hang the connector dispatcher and the
    /// router off it. Nothing listens for HTTP until [`Self::serve`].
    pub async fn bootstrap(
        settings: Settings,
        loader: Arc<dyn CatalogLoader>,
        broker: Arc<dyn Broker>,
        connectors: ConnectorRegistry,
    ) -> Result<Self> {
        let orchestrator = Orchestrator::start(settings, loader, broker.clone())
            .await
            .context("could not start the orchestrator")?;

        let publisher: Arc<dyn EventPublisher> = orchestrator.clone();
        let dispatcher = Arc::new(ConnectorDispatcher::new(
            connectors,
            broker,
            publisher,
            orchestrator.subscribe_context(),
        ));
        let supervisor = dispatcher.spawn_supervisor();
        let router = MessageRouter::new(orchestrator.clone(), dispatcher.clone());

        Ok(Self {
            orchestrator,
            dispatcher,
            router,
            stop: CancellationToken::new(),
            supervisor: Some(supervisor),
            delivery_pump: None,
            server: None,
            watcher: None,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn dispatcher(&self) -> &Arc<ConnectorDispatcher> {
        &self.dispatcher
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// With the in-process broker there is no HTTP hop: pushes to the
    /// ingress URL are routed straight from the broker's sink.
    pub fn attach_memory_delivery(&mut self, broker: &InMemoryBroker) {
        let mut rx = broker.bind_delivery(&self.orchestrator.settings().ingress_url());
        let router = self.router.clone();
        let stop = self.stop.clone();
        self.delivery_pump = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            let _ = router.dispatch(event);
                        }
                        None => break,
                    },
                }
            }
        }));
    }

    /// Reload the catalog whenever a descriptor in `dir` changes.
    pub async fn watch_catalog(&mut self, dir: PathBuf) -> Result<()> {
        let watch = Arc::new(CatalogWatch::new(&self.orchestrator));
        let watcher = DirectoryWatcher::new(dir, watch, CATALOG_POLL, CATALOG_SETTLE).await?;
        self.watcher = Some(watcher);
        Ok(())
    }

    pub fn routes(&self) -> Router {
        http::routes(HttpState::new(self.orchestrator.clone(), self.router.clone()))
    }

    /// Bind `settings.host:settings.port` and serve in the background.
    pub async fn serve(&mut self) -> Result<()> {
        let settings = self.orchestrator.settings();
        let addr = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("could not bind {addr}"))?;
        self.serve_on(listener);
        Ok(())
    }

    pub fn serve_on(&mut self, listener: TcpListener) {
        let app = self.routes();
        let stop = self.stop.clone();
        self.server = Some(tokio::spawn(async move {
            if let Err(e) = http::serve(listener, app, stop).await {
                error!("HTTP server failed: {:#}", e);
            }
        }));
    }

    /// Stop serving, release the broker and retire the active connector.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
        if let Some(pump) = self.delivery_pump.take() {
            let _ = pump.await;
        }
        self.orchestrator.shutdown().await;
        self.dispatcher.shutdown().await;
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        info!("CoffeeShop stopped");
    }
}
