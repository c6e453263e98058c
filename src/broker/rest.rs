use std::time::Duration;
use async_trait::async_trait;
use connector_plugin::{Attributes, Broker, BrokerError, ClientId, TopicEvent};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::debug;
use url::Url;

/// Extra time allowed on top of a poll window before the request is
/// considered lost.
const POLL_SLACK: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// REST adapter for an external broker.
///
/// ```text
/// POST {base}/subscribe    ?topic=&clientID=[&url=]
/// POST {base}/unsubscribe  ?topic=&clientID=
/// POST {base}/event        ?topic=&clientID=      body: JSON attributes
/// GET  {base}/event        ?topic=&clientID=&timeOut=<secs>  -> JSON [TopicEvent]
/// ```
#[derive(Debug, Clone)]
pub struct RestBroker {
    base: Url,
    http: Client,
}

impl RestBroker {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            http: Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), path)
    }

    async fn send(&self, request: RequestBuilder, topic: &str) -> Result<Response, BrokerError> {
        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::CONFLICT => Err(BrokerError::Conflict(topic.to_string())),
            s => Err(BrokerError::Transport(format!("broker answered {} for `{}`", s, topic))),
        }
    }
}

#[async_trait]
impl Broker for RestBroker {
    fn register_client(&self, name: &str) -> ClientId {
        ClientId(name.to_string())
    }

    async fn remove_client(&self, client: &ClientId) -> Result<(), BrokerError> {
        let request = self
            .http
            .post(self.endpoint("client/remove"))
            .query(&[("clientID", client.as_str())])
            .timeout(REQUEST_TIMEOUT);
        self.send(request, "").await.map(|_| ())
    }

    async fn subscribe(
        &self,
        client: &ClientId,
        topic: &str,
        delivery_url: Option<&str>,
    ) -> Result<(), BrokerError> {
        let mut query = vec![("topic", topic), ("clientID", client.as_str()), ("type", "http")];
        if let Some(url) = delivery_url {
            query.push(("url", url));
        }
        let request = self
            .http
            .post(self.endpoint("subscribe"))
            .query(&query)
            .timeout(REQUEST_TIMEOUT);
        self.send(request, topic).await.map(|_| ())
    }

    async fn unsubscribe(&self, client: &ClientId, topic: &str) -> Result<(), BrokerError> {
        let request = self
            .http
            .post(self.endpoint("unsubscribe"))
            .query(&[("topic", topic), ("clientID", client.as_str()), ("type", "http")])
            .timeout(REQUEST_TIMEOUT);
        self.send(request, topic).await.map(|_| ())
    }

    async fn publish(
        &self,
        client: &ClientId,
        topic: &str,
        attributes: &Attributes,
    ) -> Result<(), BrokerError> {
        let request = self
            .http
            .post(self.endpoint("event"))
            .query(&[("topic", topic), ("clientID", client.as_str())])
            .json(attributes)
            .timeout(REQUEST_TIMEOUT);
        self.send(request, topic).await.map(|_| ())
    }

    async fn poll(
        &self,
        client: &ClientId,
        topic: &str,
        max_wait: Duration,
    ) -> Result<Vec<TopicEvent>, BrokerError> {
        let wait = max_wait.as_secs().to_string();
        let request = self
            .http
            .get(self.endpoint("event"))
            .query(&[("topic", topic), ("clientID", client.as_str()), ("timeOut", wait.as_str())])
            .timeout(max_wait + POLL_SLACK);
        let response = self.send(request, topic).await?;
        let events: Vec<TopicEvent> = response
            .json()
            .await
            .map_err(|e| BrokerError::Transport(format!("malformed event list: {}", e)))?;
        debug!("polled {} event(s) from {}", events.len(), topic);
        Ok(events)
    }
}
