use causerie_shared::UserId;
use thiserror::Error;

/// Media failures. The `Display` text is shown to the user as the reason
/// a call ended.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Microphone access was denied")]
    PermissionDenied,

    #[error("No microphone was found")]
    NoInputDevice,

    #[error("No speaker was found")]
    NoOutputDevice,

    #[error("Audio capture is not supported on this system")]
    Unsupported,

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Call negotiation failed: {0}")]
    Negotiation(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

/// Local commands that do not fit the current call state.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call with {0}")]
    AlreadyInCall(UserId),

    #[error("Cannot call yourself")]
    SelfCall,

    #[error("No incoming call to answer")]
    NoIncomingCall,

    #[error("No active call")]
    NoActiveCall,
}
