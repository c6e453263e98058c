// src/router.rs

use std::sync::Arc;
use connector_plugin::{Attributes, TopicEvent};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::{
    connector::ConnectorDispatcher,
    error::DecodeError,
    message_board::{MessageBoard, ANONYMOUS},
    orchestrator::Orchestrator,
};

/// Where an inbound event came from, decided by its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Menu,
    Sms,
    Social,
    Application,
    Unknown,
}

/// A decoded SMS / social text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `select <n>`, 1-based.
    Select(usize),
    /// `say <text>`; the text keeps its original case.
    Say(String),
    /// No keyword the container understands.
    Passthrough,
}

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Queued { index: usize, resolved: bool },
    Board { name: String, message: String },
    Forwarded,
    Delivered,
    Dropped(String),
}

/// Decode a text message: the first whitespace-delimited token,
/// lower-cased, is the keyword.
pub fn decode_command(body: &str) -> Result<Command, DecodeError> {
    let original = body.trim();
    if original.is_empty() {
        return Err(DecodeError::Empty);
    }
    let lowered = original.to_lowercase();
    let Some((keyword, rest)) = lowered.split_once(char::is_whitespace) else {
        return Ok(Command::Passthrough);
    };

    match keyword {
        "select" => {
            let raw = rest.trim();
            match raw.parse::<usize>() {
                Ok(n) if n >= 1 => Ok(Command::Select(n)),
                _ => Err(DecodeError::BadIndex(raw.to_string())),
            }
        }
        "say" => {
            let text = original
                .split_once(char::is_whitespace)
                .map(|(_, text)| text.trim())
                .unwrap_or_default();
            Ok(Command::Say(text.to_string()))
        }
        _ => Ok(Command::Passthrough),
    }
}

/// Board name for an SMS sender: the last four characters of the number.
pub fn sms_sender(from: Option<&str>) -> String {
    match from.map(str::trim) {
        None | Some("") => ANONYMOUS.to_string(),
        Some(number) if number.chars().count() < 4 => "user".to_string(),
        Some(number) => {
            let skip = number.chars().count() - 4;
            number.chars().skip(skip).collect()
        }
    }
}

fn social_sender(name: Option<&str>) -> String {
    match name.map(str::trim) {
        None | Some("") => ANONYMOUS.to_string(),
        Some(name) => name.to_string(),
    }
}

/// Classifies broker deliveries and hands them to the run queue, the
/// message board or the active connector.
///
/// Holds no mutable state of its own; each delivery can be routed on its
/// own task.
#[derive(Clone)]
pub struct MessageRouter {
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<ConnectorDispatcher>,
}

impl MessageRouter {
    pub fn new(orchestrator: Arc<Orchestrator>, dispatcher: Arc<ConnectorDispatcher>) -> Self {
        Self {
            orchestrator,
            dispatcher,
        }
    }

    fn board(&self) -> &Arc<MessageBoard> {
        self.orchestrator.message_board()
    }

    pub fn classify(&self, event: &TopicEvent) -> Source {
        let settings = self.orchestrator.settings();
        if event.topic == settings.sms_topic {
            Source::Sms
        } else if event.topic == settings.osn_topic {
            Source::Social
        } else if event.topic == settings.menu_topic {
            Source::Menu
        } else if event.topic == self.orchestrator.current_application().topic() {
            Source::Application
        } else {
            Source::Unknown
        }
    }

    /// Route one delivery on its own task.
    pub fn dispatch(&self, event: TopicEvent) -> JoinHandle<Routed> {
        let router = self.clone();
        let span = info_span!("delivery", id = %Uuid::new_v4(), topic = %event.topic);
        tokio::spawn(async move { router.route(event).await }.instrument(span))
    }

    pub async fn route(&self, event: TopicEvent) -> Routed {
        let source = self.classify(&event);
        debug!("routing {:?} event", source);
        let routed = match source {
            Source::Sms => {
                self.decode_text(event, "message", |e| sms_sender(e.attribute("from")))
                    .await
            }
            Source::Social => {
                self.decode_text(event, "data", |e| social_sender(e.attribute("friendlyname")))
                    .await
            }
            Source::Menu => self.menu(&event).await,
            Source::Application => {
                self.orchestrator.notify_activity().await;
                self.dispatcher.receive_event(event).await;
                Routed::Delivered
            }
            Source::Unknown => Routed::Dropped(format!("no route for topic `{}`", event.topic)),
        };
        if let Routed::Dropped(reason) = &routed {
            info!("Dropped inbound message: {}", reason);
        }
        routed
    }

    /// Traffic posted straight to the container instead of through the
    /// broker goes to the active connector.
    pub async fn send_to_application(&self, attributes: Attributes) -> Routed {
        self.dispatcher.send_event(attributes).await;
        Routed::Forwarded
    }

    async fn decode_text<F>(&self, event: TopicEvent, body_attr: &str, sender: F) -> Routed
    where
        F: Fn(&TopicEvent) -> String,
    {
        let Some(body) = event.attribute(body_attr) else {
            return Routed::Dropped(
                DecodeError::MissingAttribute {
                    topic: event.topic.clone(),
                    attribute: body_attr.to_string(),
                }
                .to_string(),
            );
        };

        match decode_command(body) {
            Ok(Command::Select(n)) => self.queue(n).await,
            Ok(Command::Say(message)) => {
                let name = sender(&event);
                let mut post = Attributes::new();
                post.insert("name".to_string(), name.clone());
                post.insert("message".to_string(), message.clone());
                match self.board().push(post).await {
                    Ok(()) => Routed::Board { name, message },
                    Err(e) => {
                        error!("Could not send message to message board: {}", e);
                        Routed::Dropped(e.to_string())
                    }
                }
            }
            Ok(Command::Passthrough) => self.send_to_application(event.attributes.clone()).await,
            Err(e) => Routed::Dropped(format!("incorrectly formatted message `{}`: {}", body, e)),
        }
    }

    async fn menu(&self, event: &TopicEvent) -> Routed {
        let Some(raw) = event.attribute("menuNum") else {
            return Routed::Dropped(
                DecodeError::MissingAttribute {
                    topic: event.topic.clone(),
                    attribute: "menuNum".to_string(),
                }
                .to_string(),
            );
        };
        match raw.trim().parse::<usize>() {
            Ok(n) if n >= 1 => self.queue(n).await,
            _ => Routed::Dropped(DecodeError::BadIndex(raw.to_string()).to_string()),
        }
    }

    async fn queue(&self, n: usize) -> Routed {
        let index = n - 1;
        let resolved = self.orchestrator.queue_application(index).await;
        Routed::Queued { index, resolved }
    }
}
