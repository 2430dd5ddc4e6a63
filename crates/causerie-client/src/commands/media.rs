use causerie_media::{CallError, CallEvent};
use causerie_shared::UserId;

use crate::error::ClientError;
use crate::presence::PresenceTracker;

#[derive(Debug, Clone, PartialEq)]
pub enum CallCommand {
    Start(UserId),
    Accept,
    Reject,
    Hangup,
    Mute(bool),
}

impl From<CallCommand> for CallEvent {
    fn from(cmd: CallCommand) -> Self {
        match cmd {
            CallCommand::Start(peer) => CallEvent::Initiate(peer),
            CallCommand::Accept => CallEvent::Accept,
            CallCommand::Reject => CallEvent::Reject,
            CallCommand::Hangup => CallEvent::Hangup,
            CallCommand::Mute(muted) => CallEvent::SetMuted(muted),
        }
    }
}

/// Only users in the presence list can be called.
pub fn check_callable(
    presence: &PresenceTracker,
    local_user: &UserId,
    peer: &UserId,
) -> Result<(), ClientError> {
    if peer == local_user {
        return Err(CallError::SelfCall.into());
    }
    if !presence.contains(peer) {
        return Err(ClientError::PeerOffline(peer.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_callable() {
        let alice = UserId::from("alice");
        let mut presence = PresenceTracker::new(alice.clone());
        presence.update("alice,bob");

        assert!(check_callable(&presence, &alice, &UserId::from("bob")).is_ok());
        assert!(matches!(
            check_callable(&presence, &alice, &alice),
            Err(ClientError::Call(CallError::SelfCall))
        ));
        assert!(matches!(
            check_callable(&presence, &alice, &UserId::from("carol")),
            Err(ClientError::PeerOffline(_))
        ));
    }
}
