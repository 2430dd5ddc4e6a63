use thiserror::Error;

use causerie_media::{CallError, MediaError};
use causerie_net::NetError;
use causerie_shared::{ProtocolError, UserId};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection error: {0}")]
    Net(#[from] NetError),

    #[error("{0}")]
    Call(#[from] CallError),

    #[error("{0}")]
    Media(#[from] MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Cannot send a private message to yourself")]
    SelfAddressed,

    #[error("{0} is not online")]
    PeerOffline(UserId),

    #[error("Not an image: {0}")]
    NotAnImage(String),
}
