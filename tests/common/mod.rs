#![allow(dead_code)]

use std::{sync::Arc, time::Duration};
use coffeeshop::{
    apps::CoffeeShopApp,
    broker::InMemoryBroker,
    catalog::{AppDescriptor, AppRegistry, ConnectionInfo, Parameter, StaticCatalogLoader},
    config::Settings,
    connector::ConnectorRegistry,
    orchestrator::Orchestrator,
};

pub fn descriptor(id: &str, connector: &str, idle_timeout: u64) -> AppDescriptor {
    AppDescriptor {
        id: id.to_string(),
        name: format!("{id} app"),
        image_url: format!("http://img/{id}.png"),
        description: String::new(),
        instructions: String::new(),
        idle_timeout,
        connection: ConnectionInfo {
            topic: format!("{id}_topic"),
            connector: connector.to_string(),
            display_url: format!("http://apps/{id}"),
            app_type: "web".to_string(),
            fullscreen: false,
        },
        parameters: vec![],
    }
}

/// wall is the default; quiz, counter (heartbeat), poll are selectable.
pub fn registry() -> AppRegistry {
    let mut counter = descriptor("counter", "heartbeat", 30);
    counter.parameters = vec![
        Parameter {
            name: "watchTopic".to_string(),
            value: "counter_taps".to_string(),
        },
        Parameter {
            name: "intervalSeconds".to_string(),
            value: "1".to_string(),
        },
    ];
    AppRegistry::new(
        descriptor("wall", "default", 30),
        vec![
            descriptor("quiz", "default", 30),
            counter,
            descriptor("poll", "default", 30),
        ],
        vec![descriptor("archive", "default", 30)],
    )
    .unwrap()
}

pub fn fast_settings() -> Settings {
    Settings {
        idle_poll: Duration::from_millis(30),
        board_poll: Duration::from_millis(100),
        ..Settings::default()
    }
}

pub async fn orchestrator(
    broker: &InMemoryBroker,
    registry: AppRegistry,
    settings: Settings,
) -> Arc<Orchestrator> {
    Orchestrator::start(
        settings,
        Arc::new(StaticCatalogLoader::new(registry)),
        Arc::new(broker.clone()),
    )
    .await
    .unwrap()
}

pub async fn shop(broker: &InMemoryBroker) -> CoffeeShopApp {
    CoffeeShopApp::bootstrap(
        fast_settings(),
        Arc::new(StaticCatalogLoader::new(registry())),
        Arc::new(broker.clone()),
        ConnectorRegistry::with_builtin(),
    )
    .await
    .unwrap()
}

/// Poll `check` every 20ms for up to `limit`.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
