//! Per-client session state owned by the controller.

use causerie_shared::{ConnectionState, ProfileRef, UserId};

use crate::presence::PresenceTracker;

/// Everything the client knows about its own membership in the chat.
///
/// Created when the user picks a name and dropped when they leave.
pub struct Session {
    /// Display name chosen at join time.
    pub local_user: UserId,

    /// Profile image attached to outgoing envelopes.
    pub profile: Option<ProfileRef>,

    /// Mirror of the transport state, for status display.
    pub connection: ConnectionState,

    /// Other users currently in the chat.
    pub active_peers: PresenceTracker,
}

impl Session {
    pub fn new(local_user: UserId, profile: Option<ProfileRef>) -> Self {
        Self {
            active_peers: PresenceTracker::new(local_user.clone()),
            local_user,
            profile,
            connection: ConnectionState::Disconnected,
        }
    }
}
