pub mod broker;
pub mod message;
pub mod plugin;

pub use broker::{Broker, BrokerError, ClientId};
pub use message::{attributes, Attributes, TopicEvent};
pub use plugin::{
    Connector, ConnectorContext, ConnectorError, ConnectorFactory, ConnectorLease, EventPublisher,
};
