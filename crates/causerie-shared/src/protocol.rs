use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::{MAX_FILE_SIZE, SYSTEM_SENDER};
use crate::error::ProtocolError;
use crate::types::{ProfileRef, UserId};

/// Wire `type` of a chat envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    Chat,
    Join,
    Leave,
    File,
    /// Presence snapshot; only the broker emits it
    Users,
}

/// A chat, file, join/leave or presence message.
///
/// `receiver == None` means public scope. Envelopes are built once by
/// the sender and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub sender: UserId,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub receiver: Option<UserId>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "profilePic", default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileRef>,
    #[serde(flatten)]
    pub file: Option<FilePayload>,
}

/// Attachment carried inline on a `FILE` envelope
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct FilePayload {
    #[serde(rename = "fileName")]
    pub name: String,
    #[serde(rename = "fileType", default)]
    pub mime_type: String,
    #[serde(rename = "fileSize", default)]
    pub size_bytes: u64,
    /// Base64 body. Absent when the sender failed to read the file.
    #[serde(rename = "fileData", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ChatEnvelope {
    fn new(kind: EnvelopeKind, sender: UserId, content: String) -> Self {
        Self {
            kind,
            sender,
            receiver: None,
            content,
            timestamp: Utc::now(),
            profile: None,
            file: None,
        }
    }

    pub fn chat(sender: UserId, content: impl Into<String>, receiver: Option<UserId>) -> Self {
        Self {
            receiver,
            ..Self::new(EnvelopeKind::Chat, sender, content.into())
        }
    }

    pub fn file(
        sender: UserId,
        file: FilePayload,
        caption: impl Into<String>,
        receiver: Option<UserId>,
    ) -> Self {
        Self {
            receiver,
            file: Some(file),
            ..Self::new(EnvelopeKind::File, sender, caption.into())
        }
    }

    pub fn join(sender: UserId) -> Self {
        let content = format!("{sender} joined the chat");
        Self::new(EnvelopeKind::Join, sender, content)
    }

    pub fn leave(sender: UserId) -> Self {
        let content = format!("{sender} left the chat");
        Self::new(EnvelopeKind::Leave, sender, content)
    }

    /// Presence snapshot as broadcast by the broker.
    pub fn presence<'a>(members: impl IntoIterator<Item = &'a UserId>) -> Self {
        let content = members
            .into_iter()
            .map(UserId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Self::new(EnvelopeKind::Users, UserId::from(SYSTEM_SENDER), content)
    }

    pub fn with_profile(mut self, profile: Option<ProfileRef>) -> Self {
        self.profile = profile;
        self
    }

    pub fn is_public(&self) -> bool {
        self.receiver.is_none()
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl std::fmt::Display for ChatEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} from {}", self.kind, self.sender)?;
        match &self.receiver {
            Some(receiver) => write!(f, " to {receiver}")?,
            None => f.write_str(" (public)")?,
        }
        if let Some(file) = &self.file {
            write!(f, " file={:?}", file)?;
        }
        write!(f, " content_len={}", self.content.len())
    }
}

impl FilePayload {
    /// Reject a file before anything is read or sent.
    pub fn check_size(size: u64) -> Result<(), ProtocolError> {
        if size > MAX_FILE_SIZE {
            return Err(ProtocolError::FileTooLarge {
                size,
                max: MAX_FILE_SIZE,
            });
        }
        Ok(())
    }

    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: &[u8],
    ) -> Result<Self, ProtocolError> {
        let size_bytes = bytes.len() as u64;
        Self::check_size(size_bytes)?;
        Ok(Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size_bytes,
            data: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.data.as_deref().is_some_and(|d| !d.is_empty())
    }

    pub fn decode(&self) -> Result<Vec<u8>, ProtocolError> {
        let data = self
            .data
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or(ProtocolError::MissingFileData)?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|_| ProtocolError::InvalidFileData)
    }

    /// Human-readable size such as `1.5 KB`.
    pub fn display_size(&self) -> String {
        const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
        if self.size_bytes == 0 {
            return "0 Bytes".to_string();
        }
        let mut value = self.size_bytes as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        let formatted = format!("{value:.2}");
        let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
        format!("{trimmed} {}", UNITS[unit])
    }
}

// Keeps multi-megabyte base64 bodies out of log lines.
impl std::fmt::Debug for FilePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePayload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.size_bytes)
            .field("data", &self.data.as_ref().map(|_| "[BASE64_DATA]"))
            .finish()
    }
}

/// Call-control message, always addressed to a single receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallMessage {
    #[serde(flatten)]
    pub signal: CallSignal,
    pub sender: UserId,
    pub receiver: UserId,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallSignal {
    CallOffer { offer: SessionDescription },
    CallAnswer { answer: SessionDescription },
    IceCandidate { candidate: IceCandidate },
    CallReject {
        #[serde(default)]
        reason: RejectReason,
    },
    CallEnd,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    Busy,
    #[default]
    Rejected,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

impl CallSignal {
    /// Wire name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            CallSignal::CallOffer { .. } => "CALL_OFFER",
            CallSignal::CallAnswer { .. } => "CALL_ANSWER",
            CallSignal::IceCandidate { .. } => "ICE_CANDIDATE",
            CallSignal::CallReject { .. } => "CALL_REJECT",
            CallSignal::CallEnd => "CALL_END",
        }
    }
}

impl CallMessage {
    pub fn new(sender: UserId, receiver: UserId, signal: CallSignal) -> Self {
        Self {
            signal,
            sender,
            receiver,
            timestamp: Utc::now(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Missing, null and blank receivers all mean public scope.
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<UserId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(UserId))
}
