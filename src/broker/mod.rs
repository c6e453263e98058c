/*
   Broker adapters behind connector_plugin::Broker.

   memory  -> in-process broker (development, tests)
   rest    -> external broker reached over HTTP
*/
pub mod memory;
pub mod rest;

pub use memory::InMemoryBroker;
pub use rest::RestBroker;
