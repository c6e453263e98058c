// src/http.rs
//
// The container's HTTP surface: broker delivery ingress, the display
// polling endpoint and the message board feed.

use std::sync::Arc;
use axum::{
    Router,
    body::Bytes,
    extract::{Query, RawQuery, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use connector_plugin::{Attributes, TopicEvent};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::{
    config::INGRESS_PATH,
    display::{self, PollRequest},
    orchestrator::Orchestrator,
    router::MessageRouter,
};

pub const COMMUNICATION_PATH: &str = "/CoffeeShop/communication";
pub const MESSAGE_BOARD_PATH: &str = "/CoffeeShop/messageBoard";

const EXPIRES_IN_THE_PAST: &str = "Sat, 6 May 1995 12:00:00 GMT";
const NO_CACHE: &str = "no-store, no-cache, must-revalidate, post-check=0, pre-check=0";

#[derive(Clone)]
pub struct HttpState {
    orchestrator: Arc<Orchestrator>,
    router: MessageRouter,
}

impl HttpState {
    pub fn new(orchestrator: Arc<Orchestrator>, router: MessageRouter) -> Self {
        Self {
            orchestrator,
            router,
        }
    }
}

/// A broker push carries one event or a batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum Delivery {
    One(TopicEvent),
    Many(Vec<TopicEvent>),
}

impl Delivery {
    fn into_events(self) -> Vec<TopicEvent> {
        match self {
            Delivery::One(event) => vec![event],
            Delivery::Many(events) => events,
        }
    }
}

#[derive(Deserialize)]
struct PollQuery {
    #[serde(default, rename = "type")]
    kind: PollRequest,
}

pub fn routes(state: HttpState) -> Router {
    Router::new()
        .route(INGRESS_PATH, get(ingress).post(ingress))
        .route(COMMUNICATION_PATH, get(communication))
        .route(MESSAGE_BOARD_PATH, get(board_feed).post(board_post))
        .with_state(state)
}

/// Serve `app` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled_owned().await })
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

/// Query string and url-encoded body merged; body values win.
pub(crate) fn form_params(query: Option<&str>, body: &[u8]) -> Attributes {
    let mut params = Attributes::new();
    if let Some(query) = query {
        params.extend(
            form_urlencoded::parse(query.as_bytes()).map(|(k, v)| (k.into_owned(), v.into_owned())),
        );
    }
    params.extend(form_urlencoded::parse(body).map(|(k, v)| (k.into_owned(), v.into_owned())));
    params
}

fn no_cache(content_type: &'static str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::EXPIRES, EXPIRES_IN_THE_PAST),
            (header::CACHE_CONTROL, NO_CACHE),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn ingress(
    State(state): State<HttpState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> StatusCode {
    if let Ok(delivery) = serde_json::from_slice::<Delivery>(&body) {
        let events = delivery.into_events();
        debug!("broker delivered {} event(s)", events.len());
        for event in events {
            // detached, the router logs its own outcome
            let _ = state.router.dispatch(event);
        }
        return StatusCode::OK;
    }

    let params = form_params(query.as_deref(), &body);
    if params.is_empty() {
        warn!("Ignoring empty request on the delivery endpoint");
        return StatusCode::BAD_REQUEST;
    }
    state.router.send_to_application(params).await;
    StatusCode::OK
}

async fn communication(
    State(state): State<HttpState>,
    Query(query): Query<PollQuery>,
) -> Response {
    let xml = display::respond(&state.orchestrator, query.kind).await;
    no_cache("text/xml; charset=utf-8", xml)
}

async fn board_feed(State(state): State<HttpState>) -> Response {
    let events = state
        .orchestrator
        .message_board()
        .pull(state.orchestrator.settings().board_poll)
        .await;
    no_cache("text/xml; charset=utf-8", display::message_board_xml(&events))
}

async fn board_post(
    State(state): State<HttpState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let params = form_params(query.as_deref(), &body);
    let result = match state.orchestrator.message_board().push(params).await {
        Ok(()) => "Result: Success".to_string(),
        Err(e) => {
            warn!("Message board post failed: {}", e);
            format!("Result: Failure: {e}")
        }
    };
    no_cache("text/plain; charset=utf-8", result)
}
