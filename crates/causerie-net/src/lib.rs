// Broker transport: JSON frames over a WebSocket, plus the session
// lifecycle (connect, subscribe, join, leave, reconnect) built on top.

pub mod connection;
pub mod error;
pub mod frame;
pub mod session;

pub use connection::{
    Connector, TransportCommand, TransportLink, TransportNotification, WsConnector,
};
pub use error::NetError;
pub use frame::{ClientFrame, ServerFrame};
pub use session::{SessionConfig, SessionManager};
