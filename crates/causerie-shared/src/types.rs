use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_PROFILE_IMAGE_SIZE, MAX_USER_NAME_LEN};
use crate::error::ProtocolError;

/// A freely chosen display name. It is the only identity a user has.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Validate a display name typed by a user.
    ///
    /// Names are trimmed, must be non-empty, and may not contain a comma
    /// because presence snapshots are comma-joined on the wire.
    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProtocolError::InvalidUserId("name is empty".into()));
        }
        if name.contains(',') {
            return Err(ProtocolError::InvalidUserId(format!(
                "{name:?} contains a comma"
            )));
        }
        if name.chars().count() > MAX_USER_NAME_LEN {
            return Err(ProtocolError::InvalidUserId(format!(
                "longer than {MAX_USER_NAME_LEN} characters"
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque profile picture reference (a `data:` URL) carried on envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ProfileRef(pub String);

impl ProfileRef {
    /// Encode an image as a data URL, enforcing the profile image cap.
    pub fn from_image(mime_type: &str, bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_PROFILE_IMAGE_SIZE {
            return Err(ProtocolError::ProfileImageTooLarge {
                size: bytes.len(),
                max: MAX_PROFILE_IMAGE_SIZE,
            });
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(Self(format!("data:{mime_type};base64,{encoded}")))
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Logical channels a client subscribes to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Public broadcast topic
    Public,
    /// Per-user private message queue
    Private,
    /// Per-user private file queue
    PrivateFile,
    /// Per-user call-control queue
    Call,
    /// Server-driven presence snapshots
    Presence,
}

impl Channel {
    /// Every channel, in subscription order.
    pub const ALL: [Channel; 5] = [
        Channel::Public,
        Channel::Private,
        Channel::PrivateFile,
        Channel::Call,
        Channel::Presence,
    ];

    pub fn destination(&self) -> &'static str {
        match self {
            Channel::Public => "/topic/public",
            Channel::Private => "/user/queue/private",
            Channel::PrivateFile => "/user/queue/private-file",
            Channel::Call => "/user/queue/call",
            Channel::Presence => "/topic/users",
        }
    }

    pub fn from_destination(destination: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.destination() == destination)
    }

    /// Whether the channel is addressed to a single user.
    pub fn is_private(&self) -> bool {
        matches!(self, Channel::Private | Channel::PrivateFile | Channel::Call)
    }
}

/// Application actions a client sends to the broker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AppDestination {
    SendMessage,
    SendFile,
    AddUser,
    Leave,
    CallMessage,
}

impl AppDestination {
    pub const ALL: [AppDestination; 5] = [
        AppDestination::SendMessage,
        AppDestination::SendFile,
        AppDestination::AddUser,
        AppDestination::Leave,
        AppDestination::CallMessage,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            AppDestination::SendMessage => "/app/chat.sendMessage",
            AppDestination::SendFile => "/app/chat.file",
            AppDestination::AddUser => "/app/chat.addUser",
            AppDestination::Leave => "/app/chat.leave",
            AppDestination::CallMessage => "/app/call.sendMessage",
        }
    }

    pub fn from_path(path: &str) -> Result<Self, ProtocolError> {
        Self::ALL
            .into_iter()
            .find(|d| d.path() == path)
            .ok_or_else(|| ProtocolError::UnknownDestination(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_parse() {
        assert_eq!(UserId::parse("  alice ").unwrap().as_str(), "alice");
        assert!(UserId::parse("   ").is_err());
        assert!(UserId::parse("a,b").is_err());
        assert!(UserId::parse(&"x".repeat(MAX_USER_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_channel_destinations() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_destination(channel.destination()), Some(channel));
        }
        assert_eq!(Channel::from_destination("/topic/nope"), None);
        assert!(!Channel::Public.is_private());
        assert!(Channel::Call.is_private());
    }

    #[test]
    fn test_profile_image_cap() {
        let ok = ProfileRef::from_image("image/png", &[0u8; MAX_PROFILE_IMAGE_SIZE]).unwrap();
        assert!(ok.as_str().starts_with("data:image/png;base64,"));

        let too_big = ProfileRef::from_image("image/png", &vec![0u8; MAX_PROFILE_IMAGE_SIZE + 1]);
        assert!(matches!(
            too_big,
            Err(ProtocolError::ProfileImageTooLarge { .. })
        ));
    }
}
