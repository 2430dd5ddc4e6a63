use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] causerie_shared::ProtocolError),

    #[error("Frame encoding error: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("Broker handshake timed out")]
    HandshakeTimeout,

    #[error("Broker refused the connection: {0}")]
    Rejected(String),

    #[error("Connection closed")]
    Closed,

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },
}
