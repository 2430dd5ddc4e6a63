// Call signaling and the media side of one-to-one audio calls.

pub mod audio;
pub mod backend;
pub mod codec;
pub mod driver;
pub mod error;
pub mod peer;
pub mod signaling;

pub use backend::{AudioCapture, AudioFrame, AudioInput, LinkObserver, MediaBackend, MediaLink};
pub use driver::MediaDriver;
pub use error::{CallError, MediaError};
pub use peer::WebRtcBackend;
pub use signaling::{
    CallAction, CallEngine, CallEvent, CallId, CallNotice, CallRole, CallSession, CallState,
    EndReason, MediaEvent, MediaMode,
};
