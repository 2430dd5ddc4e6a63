//! # causerie-client
//!
//! Chat client core: joins the broker session, routes chat, file,
//! presence and call-signaling traffic, and drives one-to-one audio calls.
//! A user interface talks to it through [`ClientHandle`] by sending
//! [`ClientCommand`]s and reading [`ClientEvent`]s.

pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod presence;
pub mod router;
pub mod state;

pub use commands::{CallCommand, ClientCommand};
pub use config::ClientConfig;
pub use controller::{Client, ClientHandle};
pub use error::ClientError;
pub use events::ClientEvent;
pub use presence::PresenceTracker;
pub use router::{Dispatch, MessageRouter};
pub use state::Session;
