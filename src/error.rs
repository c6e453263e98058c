use std::path::PathBuf;
use thiserror::Error;

/// The catalog or settings could not be loaded. Fatal at startup; on a
/// reload the previous catalog stays in service.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("application id `{0}` is defined more than once")]
    DuplicateId(String),

    #[error("no default application is configured")]
    MissingDefault,

    #[error("could not read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse `{path}`: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid setting `{key}`: {reason}")]
    InvalidSetting { key: String, reason: String },
}

/// An inbound message that cannot be acted upon. Logged and dropped.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("event on `{topic}` has no `{attribute}` attribute")]
    MissingAttribute { topic: String, attribute: String },

    #[error("message is empty")]
    Empty,

    #[error("`{0}` is not a menu number")]
    BadIndex(String),
}
