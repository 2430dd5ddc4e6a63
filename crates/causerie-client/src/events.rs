//! Events the client reports to its user interface.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use causerie_media::{CallNotice, EndReason};
use causerie_shared::{ChatEnvelope, ConnectionState, FilePayload, UserId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    ConnectionChanged(ConnectionPayload),
    PresenceChanged(PresencePayload),
    NewMessage(MessagePayload),
    NewFile(FileMessagePayload),
    SystemNotice(NoticePayload),
    CallStateChanged(CallPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionPayload {
    pub state: ConnectionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresencePayload {
    pub users: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePayload {
    pub sender: UserId,
    pub receiver: Option<UserId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Sent by the local user (optimistic echo)
    pub outgoing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileMessagePayload {
    pub sender: UserId,
    pub receiver: Option<UserId>,
    pub caption: String,
    pub name: String,
    pub mime_type: String,
    pub size: String,
    pub timestamp: DateTime<Utc>,
    pub outgoing: bool,
    #[serde(skip)]
    pub file: FilePayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoticePayload {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallPayload {
    pub state: &'static str,
    pub peer: Option<UserId>,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub muted: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
}

impl ClientEvent {
    pub fn message(envelope: ChatEnvelope, outgoing: bool) -> Self {
        ClientEvent::NewMessage(MessagePayload {
            sender: envelope.sender,
            receiver: envelope.receiver,
            content: envelope.content,
            timestamp: envelope.timestamp,
            outgoing,
        })
    }

    /// `None` when the envelope carries no attachment.
    pub fn file(envelope: ChatEnvelope, outgoing: bool) -> Option<Self> {
        let file = envelope.file?;
        Some(ClientEvent::NewFile(FileMessagePayload {
            sender: envelope.sender,
            receiver: envelope.receiver,
            caption: envelope.content,
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.display_size(),
            timestamp: envelope.timestamp,
            outgoing,
            file,
        }))
    }

    pub fn notice(text: impl Into<String>) -> Self {
        ClientEvent::SystemNotice(NoticePayload {
            text: text.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn error(message: impl ToString) -> Self {
        ClientEvent::Error(ErrorPayload {
            message: message.to_string(),
        })
    }
}

impl From<CallNotice> for ClientEvent {
    fn from(notice: CallNotice) -> Self {
        let payload = match notice {
            CallNotice::Outgoing { peer } => CallPayload {
                state: "calling",
                message: format!("Calling {peer}..."),
                peer: Some(peer),
                ..CallPayload::empty()
            },
            CallNotice::Incoming { peer } => CallPayload {
                state: "ringing",
                message: format!("Incoming call from {peer}"),
                peer: Some(peer),
                ..CallPayload::empty()
            },
            CallNotice::Connected { peer, started_at } => CallPayload {
                state: "connected",
                message: format!("In call with {peer}"),
                peer: Some(peer),
                started_at: Some(started_at),
                ..CallPayload::empty()
            },
            CallNotice::MuteChanged { muted } => CallPayload {
                state: "connected",
                message: if muted { "Muted" } else { "Unmuted" }.to_string(),
                muted: Some(muted),
                ..CallPayload::empty()
            },
            CallNotice::BusyRejected { caller } => CallPayload {
                state: "busy",
                message: format!("Missed call from {caller} while busy"),
                peer: Some(caller),
                ..CallPayload::empty()
            },
            CallNotice::Ended {
                peer,
                reason,
                duration,
            } => CallPayload {
                state: if matches!(reason, EndReason::MediaFailed(_) | EndReason::LinkLost(_)) {
                    "failed"
                } else {
                    "ended"
                },
                message: reason.to_string(),
                peer: Some(peer),
                duration_secs: duration.map(|d| d.num_seconds()),
                ..CallPayload::empty()
            },
        };
        ClientEvent::CallStateChanged(payload)
    }
}

impl CallPayload {
    fn empty() -> Self {
        Self {
            state: "idle",
            peer: None,
            message: String::new(),
            started_at: None,
            duration_secs: None,
            muted: None,
        }
    }
}

/// Sending half of the UI event stream.
pub type EventSink = mpsc::UnboundedSender<ClientEvent>;

pub fn emit_event(sink: &EventSink, event: ClientEvent) {
    if let Err(e) = sink.send(event) {
        tracing::debug!(event = ?e.0, "No listener for client event");
    }
}
