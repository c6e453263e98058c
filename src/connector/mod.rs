// src/connector/mod.rs

pub mod builtin;
pub mod dispatcher;
pub mod registry;

pub use builtin::{HeartbeatConnector, NoopConnector, PassThroughConnector};
pub use dispatcher::ConnectorDispatcher;
pub use registry::ConnectorRegistry;
