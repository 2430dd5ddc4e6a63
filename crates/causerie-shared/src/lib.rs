// Wire types shared by the chat client and the broker.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{
    CallMessage, CallSignal, ChatEnvelope, EnvelopeKind, FilePayload, IceCandidate,
    RejectReason, SdpKind, SessionDescription,
};
pub use types::{AppDestination, Channel, ConnectionState, ProfileRef, UserId};
