// src/display.rs
//
// Documents served to the polling display client. The tag layout is fixed;
// the client parses it positionally.

use std::fmt::Write as _;
use chrono::Local;
use connector_plugin::TopicEvent;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    catalog::{AppDescriptor, AppRegistry},
    orchestrator::Orchestrator,
};

const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// What the display asked for with `?type=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollRequest {
    Configuration,
    Queued,
    /// Anything else: the display just wants to know whether to switch.
    #[default]
    #[serde(other)]
    Context,
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn is_tag_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn element(out: &mut String, indent: usize, tag: &str, value: &str) {
    let _ = writeln!(out, "{}<{tag}>{}</{tag}>", "\t".repeat(indent), escape(value));
}

/// Every selectable application plus the default.
pub fn configuration_xml(registry: &AppRegistry) -> String {
    let default = registry.default_app();
    let mut out = format!("{XML_HEADER}<coffeeshop>\n");
    element(&mut out, 1, "mode", "configuration");
    element(&mut out, 1, "numapps", &registry.running().len().to_string());
    element(&mut out, 1, "defaultURL", &default.connection.display_url);
    element(&mut out, 1, "defaultType", &default.connection.app_type);
    element(&mut out, 1, "defaultName", &default.name);
    out.push_str("\t<applications>\n");
    for app in registry.running() {
        out.push_str("\t\t<application>\n");
        element(&mut out, 3, "name", &app.name);
        element(&mut out, 3, "img", &app.image_url);
        out.push_str("\t\t</application>\n");
    }
    out.push_str("\t</applications>\n");
    out.push_str("</coffeeshop>");
    out
}

/// The application the display should switch to.
pub fn context_xml(app: &AppDescriptor) -> String {
    let mut out = format!("{XML_HEADER}<coffeeshop>\n");
    element(&mut out, 1, "mode", "context");
    out.push_str("\t<application>\n");
    element(&mut out, 2, "url", &app.connection.display_url);
    element(&mut out, 2, "type", &app.connection.app_type);
    element(&mut out, 2, "name", &app.name);
    element(&mut out, 2, "img", &app.image_url);
    element(&mut out, 2, "fullscreen", &app.connection.fullscreen.to_string());
    out.push_str("\t</application>\n");
    out.push_str("</coffeeshop>");
    out
}

/// Pending selections; the mode tag is left out when nothing is queued.
pub fn queued_xml<'a>(queue: impl IntoIterator<Item = &'a AppDescriptor>) -> String {
    let mut body = String::new();
    for app in queue {
        body.push_str("\t<application>\n");
        element(&mut body, 2, "name", &app.name);
        element(&mut body, 2, "img", &app.image_url);
        body.push_str("\t</application>\n");
    }
    let mut out = format!("{XML_HEADER}<coffeeshop>\n");
    if !body.is_empty() {
        element(&mut out, 1, "mode", "queued");
    }
    out.push_str(&body);
    out.push_str("</coffeeshop>");
    out
}

/// Nothing new.
pub fn heartbeat_xml() -> String {
    format!("{XML_HEADER}<coffeeshop>\n</coffeeshop>")
}

/// Message board posts, one `<event>` each, stamped with the serving time.
/// Attribute names that are not valid tag names are skipped.
pub fn message_board_xml(events: &[TopicEvent]) -> String {
    let stamp = Local::now().format("%b %-d, %Y %-I:%M:%S %p").to_string();
    let mut out = format!("{XML_HEADER}<events>\n");
    for event in events {
        out.push_str("\t<event>\n");
        element(&mut out, 2, "timestamp", &stamp);
        for (name, value) in &event.attributes {
            if is_tag_name(name) {
                element(&mut out, 2, name, value);
            } else {
                debug!("skipping board attribute `{}`", name);
            }
        }
        out.push_str("\t</event>\n");
    }
    out.push_str("</events>\n");
    out
}

/// Pick the document for one display poll.
///
/// Order: configuration if asked for or if it changed since the last
/// poll, then the queue if asked for, then a pending context change,
/// otherwise a heartbeat.
pub async fn respond(orchestrator: &Orchestrator, request: PollRequest) -> String {
    if request == PollRequest::Configuration {
        info!("Sending new configuration information");
        let registry = orchestrator.registry().await;
        return configuration_xml(&*registry);
    }
    if orchestrator.take_config_changed().await {
        info!("Sending new configuration information");
        let registry = orchestrator.registry().await;
        return configuration_xml(&*registry);
    }
    if request == PollRequest::Queued {
        info!("Sending queued applications");
        let queued = orchestrator.queued_applications().await;
        return queued_xml(queued.iter().map(|a| a.as_ref()));
    }
    if orchestrator.is_context_change().await {
        info!("Sending new context change information");
        return context_xml(&orchestrator.current_application());
    }
    heartbeat_xml()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::app;
    use connector_plugin::attributes;

    #[test]
    fn test_configuration_layout() {
        let registry = AppRegistry::new(
            app("wall", "default", 30),
            vec![app("quiz", "default", 30)],
            vec![app("old", "default", 30)],
        )
        .unwrap();
        let xml = configuration_xml(&registry);
        assert_eq!(
            xml,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<coffeeshop>\n\
             \t<mode>configuration</mode>\n\
             \t<numapps>1</numapps>\n\
             \t<defaultURL>http://apps/wall</defaultURL>\n\
             \t<defaultType>web</defaultType>\n\
             \t<defaultName>wall app</defaultName>\n\
             \t<applications>\n\
             \t\t<application>\n\
             \t\t\t<name>quiz app</name>\n\
             \t\t\t<img>http://img/quiz.png</img>\n\
             \t\t</application>\n\
             \t</applications>\n\
             </coffeeshop>"
        );
    }

    #[test]
    fn test_context_layout() {
        let mut quiz = app("quiz", "default", 30);
        quiz.connection.fullscreen = true;
        let xml = context_xml(&quiz);
        assert!(
            xml.contains("\t<mode>context</mode>\n\t<application>\n\t\t<url>http://apps/quiz</url>\n")
        );
        assert!(xml.contains("\t\t<fullscreen>true</fullscreen>\n\t</application>\n</coffeeshop>"));
    }

    #[test]
    fn test_queued_omits_mode_when_empty() {
        assert_eq!(queued_xml(std::iter::empty()), heartbeat_xml());
        let quiz = app("quiz", "default", 30);
        let xml = queued_xml([&quiz]);
        assert!(xml.contains("<mode>queued</mode>"));
        assert!(xml.contains("\t\t<name>quiz app</name>\n"));
    }

    #[test]
    fn test_message_board_escapes_and_skips() {
        let events = vec![TopicEvent::new(
            "messageboard",
            attributes([("name", "1234"), ("message", "fish & <chips>"), ("bad key", "x")]),
        )];
        let xml = message_board_xml(&events);
        assert!(xml.starts_with(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<events>\n\t<event>\n\t\t<timestamp>"
        ));
        assert!(xml.contains("\t\t<message>fish &amp; &lt;chips&gt;</message>\n"));
        assert!(xml.contains("\t\t<name>1234</name>\n"));
        assert!(!xml.contains("bad key"));
        assert!(xml.ends_with("</events>\n"));
    }

    #[test]
    fn test_poll_request_parsing() {
        #[derive(Deserialize)]
        struct Query {
            #[serde(default, rename = "type")]
            kind: PollRequest,
        }
        let parse = |s: &str| serde_json::from_str::<Query>(s).unwrap().kind;
        assert_eq!(parse(r#"{"type":"configuration"}"#), PollRequest::Configuration);
        assert_eq!(parse(r#"{"type":"queued"}"#), PollRequest::Queued);
        assert_eq!(parse(r#"{"type":"whatever"}"#), PollRequest::Context);
        assert_eq!(parse("{}"), PollRequest::Context);
    }
}
