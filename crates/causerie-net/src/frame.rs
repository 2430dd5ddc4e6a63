//! JSON frames exchanged with the broker over the WebSocket.
//!
//! Bodies are carried as already-encoded JSON strings so the transport
//! never needs to know the envelope types it moves.

use serde::{Deserialize, Serialize};

/// Frames sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on a new socket.
    Connect { client: String },
    /// Start receiving messages for a destination.
    Subscribe { destination: String },
    /// Invoke an application action.
    Send { destination: String, body: String },
    /// Polite goodbye before closing the socket.
    Disconnect,
}

/// Frames sent by the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted.
    Connected { server: String },
    /// A message delivered on a subscribed destination.
    Message { destination: String, body: String },
    /// A frame was refused. The socket stays open.
    Error { message: String },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
