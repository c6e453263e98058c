// src/connector/builtin.rs
//
// Connectors shipped with the container:
//   default    -> forwards text traffic to the active topic
//   noop       -> swallows everything (dispatcher fallback)
//   heartbeat  -> keeps an application alive while a watched topic is busy

use std::{sync::Arc, time::Duration};
use async_trait::async_trait;
use connector_plugin::{
    attributes, Attributes, Broker, BrokerError, ClientId, Connector, ConnectorContext,
    ConnectorError, ConnectorFactory, EventPublisher, TopicEvent,
};
use tracing::{debug, info, warn};

use crate::catalog::PASS_THROUGH_CONNECTOR;

pub const NOOP_CONNECTOR: &str = "noop";
pub const HEARTBEAT_CONNECTOR: &str = "heartbeat";

/// Published on the echo topic while the watched topic is busy.
pub const RUNNING_STILL: &str = "RUNNINGSTILL";

const HEARTBEAT_POLL: Duration = Duration::from_secs(1);
const DEFAULT_HEARTBEAT_INTERVAL: u64 = 5;

/// Built-in connector for applications that talk to the broker themselves.
pub struct PassThroughConnector {
    publisher: Arc<dyn EventPublisher>,
}

impl PassThroughConnector {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Connector for PassThroughConnector {
    fn name(&self) -> String {
        PASS_THROUGH_CONNECTOR.to_string()
    }

    async fn send_event(&self, attributes: Attributes) -> Result<(), ConnectorError> {
        self.publisher.publish_event(attributes).await?;
        Ok(())
    }

    async fn receive_event(&self, _event: TopicEvent) -> Result<(), ConnectorError> {
        // the viewer already got it from the broker
        Ok(())
    }
}

pub struct PassThroughFactory;

#[async_trait]
impl ConnectorFactory for PassThroughFactory {
    async fn create(&self, ctx: ConnectorContext) -> Result<Arc<dyn Connector>, ConnectorError> {
        Ok(Arc::new(PassThroughConnector::new(ctx.publisher)))
    }
}

/// Does nothing, successfully.
#[derive(Debug, Default)]
pub struct NoopConnector;

#[async_trait]
impl Connector for NoopConnector {
    fn name(&self) -> String {
        NOOP_CONNECTOR.to_string()
    }

    async fn send_event(&self, attributes: Attributes) -> Result<(), ConnectorError> {
        debug!("noop connector dropped {:?}", attributes);
        Ok(())
    }

    async fn receive_event(&self, event: TopicEvent) -> Result<(), ConnectorError> {
        debug!("noop connector dropped event on {}", event.topic);
        Ok(())
    }
}

pub struct NoopFactory;

#[async_trait]
impl ConnectorFactory for NoopFactory {
    async fn create(&self, _ctx: ConnectorContext) -> Result<Arc<dyn Connector>, ConnectorError> {
        Ok(Arc::new(NoopConnector))
    }
}

/// Watches a topic on its own broker client and, whenever it saw traffic,
/// publishes `{message: RUNNINGSTILL}` on the echo topic. With the echo topic
/// left at the application's own topic this keeps the idle check from
/// rotating the application away while the watched topic is busy.
///
/// Parameters: `watchTopic` (required), `echoTopic`, `intervalSeconds`.
pub struct HeartbeatConnector {
    app_id: String,
    watch_topic: String,
    echo_topic: String,
}

impl HeartbeatConnector {
    pub fn watch_topic(&self) -> &str {
        &self.watch_topic
    }

    pub fn echo_topic(&self) -> &str {
        &self.echo_topic
    }

    async fn beat(
        broker: &Arc<dyn Broker>,
        client: &ClientId,
        watch_topic: &str,
        echo_topic: &str,
    ) -> Result<bool, BrokerError> {
        let events = broker.poll(client, watch_topic, HEARTBEAT_POLL).await?;
        if events.is_empty() {
            return Ok(false);
        }
        broker
            .publish(client, echo_topic, &attributes([("message", RUNNING_STILL)]))
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl Connector for HeartbeatConnector {
    fn name(&self) -> String {
        HEARTBEAT_CONNECTOR.to_string()
    }

    async fn send_event(&self, attributes: Attributes) -> Result<(), ConnectorError> {
        debug!("heartbeat connector for {} ignores {:?}", self.app_id, attributes);
        Ok(())
    }

    async fn receive_event(&self, _event: TopicEvent) -> Result<(), ConnectorError> {
        Ok(())
    }
}

pub struct HeartbeatFactory;

#[async_trait]
impl ConnectorFactory for HeartbeatFactory {
    async fn create(&self, ctx: ConnectorContext) -> Result<Arc<dyn Connector>, ConnectorError> {
        let watch_topic = ctx
            .parameter("watchTopic")
            .ok_or_else(|| ConnectorError::Construction {
                name: HEARTBEAT_CONNECTOR.to_string(),
                reason: format!("application `{}` has no `watchTopic` parameter", ctx.app_id),
            })?
            .to_string();
        let echo_topic = ctx.parameter("echoTopic").unwrap_or(ctx.topic.as_str()).to_string();
        let interval = match ctx.parameter("intervalSeconds") {
            Some(raw) => raw.trim().parse::<u64>().map_err(|e| ConnectorError::Construction {
                name: HEARTBEAT_CONNECTOR.to_string(),
                reason: format!("bad intervalSeconds `{}`: {}", raw, e),
            })?,
            None => DEFAULT_HEARTBEAT_INTERVAL,
        };

        let broker = ctx.broker.clone();
        let client = broker.register_client(&format!("{}connector", ctx.app_id));
        match broker.subscribe(&client, &watch_topic, None).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => debug!("heartbeat already watching {}", watch_topic),
            Err(e) => warn!("heartbeat could not watch {}: {}", watch_topic, e),
        }

        {
            let broker = broker.clone();
            let client = client.clone();
            let watch_topic = watch_topic.clone();
            let echo_topic = echo_topic.clone();
            ctx.spawn_listener("heartbeat", async move {
                loop {
                    match HeartbeatConnector::beat(&broker, &client, &watch_topic, &echo_topic)
                        .await
                    {
                        Ok(true) => debug!("heartbeat echoed {} -> {}", watch_topic, echo_topic),
                        Ok(false) => {}
                        Err(e) => debug!("heartbeat poll on {} failed: {}", watch_topic, e),
                    }
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                }
            });
        }

        {
            let broker = broker.clone();
            let client = client.clone();
            let watch_topic = watch_topic.clone();
            ctx.on_retire(async move {
                if let Err(e) = broker.unsubscribe(&client, &watch_topic).await {
                    debug!("heartbeat unsubscribe from {}: {}", watch_topic, e);
                }
                if let Err(e) = broker.remove_client(&client).await {
                    debug!("heartbeat could not remove client {}: {}", client, e);
                }
            });
        }

        info!(
            "Heartbeat connector for {} watching {} every {}s",
            ctx.app_id, watch_topic, interval
        );
        Ok(Arc::new(HeartbeatConnector {
            app_id: ctx.app_id.clone(),
            watch_topic,
            echo_topic,
        }))
    }
}
