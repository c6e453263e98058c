pub mod apps;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod connector;
pub mod display;
pub mod error;
pub mod http;
pub mod logger;
pub mod message_board;
pub mod orchestrator;
pub mod router;
pub mod run_queue;
pub mod schema;
pub mod subscription;
pub mod watcher;
