use std::collections::BTreeMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Flat string attributes carried by every broker event.
pub type Attributes = BTreeMap<String, String>;

/// One event as delivered or polled from the broker.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct TopicEvent {
    pub topic: String,                   // Topic the event was published on
    #[serde(default)]
    pub attributes: Attributes,          // name -> value, ordered by name
}

impl TopicEvent {
    pub fn new(topic: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            topic: topic.into(),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Attribute names in name order, as used by the message-board feed.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }
}

/// Build an attribute map from literal pairs.
pub fn attributes<I, K, V>(pairs: I) -> Attributes
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
