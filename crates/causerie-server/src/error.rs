use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use causerie_shared::{ProtocolError, UserId};

/// Errors returned by the HTTP endpoints.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::UserNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Reasons a client frame is refused. Reported back on the same socket.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Join the chat before sending")]
    NotJoined,

    #[error("Connection is joined as {bound}, not {claimed}")]
    SenderMismatch { bound: UserId, claimed: UserId },

    #[error("{0} is not in the chat")]
    UnknownReceiver(UserId),

    #[error("Cannot subscribe to {0}")]
    UnknownChannel(String),

    #[error("{destination} does not accept {kind} messages")]
    WrongKind { destination: &'static str, kind: String },

    #[error("Malformed payload: {0}")]
    Protocol(#[from] ProtocolError),
}
