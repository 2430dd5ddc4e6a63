//! # causerie-server
//!
//! Message broker for Causerie chat clients.
//!
//! Clients connect over a WebSocket, subscribe to the chat channels and
//! invoke the application actions (send, file, join, leave, call
//! signaling). The broker keeps the presence list and routes each
//! message to the public topic or to the receiver's private queues.

pub mod api;
pub mod broker;
pub mod config;
pub mod error;

pub use api::{build_router, serve, spawn, AppState};
pub use broker::{Broker, ConnId};
pub use config::ServerConfig;
pub use error::{BrokerError, ServerError};
