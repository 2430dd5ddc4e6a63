//! Classifies inbound broker messages and builds outbound envelopes.
//!
//! Every inbound message yields exactly one [`Dispatch`]. Profile images
//! seen on other users' envelopes are cached here.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, warn};

use causerie_shared::{
    CallMessage, Channel, ChatEnvelope, EnvelopeKind, FilePayload, ProfileRef, ProtocolError,
    UserId,
};

/// Where an inbound message should go.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Raw member list for the presence tracker
    Presence(String),
    /// Join or leave announcement, shown as a system notice
    Notice(ChatEnvelope),
    Chat(ChatEnvelope),
    File(ChatEnvelope),
    /// File envelope whose data did not arrive
    FileUnavailable(ChatEnvelope),
    Call(CallMessage),
    /// Our own public message coming back; already shown when sent
    Suppressed,
    /// Malformed, misaddressed or out of place
    Dropped,
}

pub struct MessageRouter {
    local_user: UserId,
    local_profile: Option<ProfileRef>,
    profiles: HashMap<UserId, ProfileRef>,
}

impl MessageRouter {
    pub fn new(local_user: UserId, local_profile: Option<ProfileRef>) -> Self {
        Self {
            local_user,
            local_profile,
            profiles: HashMap::new(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Profile image attached to everything sent from now on.
    pub fn set_local_profile(&mut self, profile: Option<ProfileRef>) {
        self.local_profile = profile;
    }

    /// Last profile image seen from `user`.
    pub fn profile_of(&self, user: &UserId) -> Option<&ProfileRef> {
        self.profiles.get(user)
    }

    pub fn route(&mut self, channel: Channel, raw: &str) -> Dispatch {
        match channel {
            Channel::Call => match CallMessage::from_json(raw) {
                Ok(msg) => Dispatch::Call(msg),
                Err(e) => dropped(channel, &e),
            },
            Channel::Presence => match ChatEnvelope::from_json(raw) {
                Ok(envelope) if envelope.kind == EnvelopeKind::Users => {
                    Dispatch::Presence(envelope.content)
                }
                Ok(envelope) => {
                    debug!(kind = ?envelope.kind, "Ignoring non-presence message on presence topic");
                    Dispatch::Dropped
                }
                Err(e) => dropped(channel, &e),
            },
            Channel::Public | Channel::Private | Channel::PrivateFile => {
                match ChatEnvelope::from_json(raw) {
                    Ok(envelope) => {
                        self.remember_profile(&envelope);
                        self.classify(channel, envelope)
                    }
                    Err(e) => dropped(channel, &e),
                }
            }
        }
    }

    fn remember_profile(&mut self, envelope: &ChatEnvelope) {
        if envelope.sender == self.local_user {
            return;
        }
        if let Some(profile) = envelope.profile.as_ref().filter(|p| !p.is_empty()) {
            self.profiles
                .insert(envelope.sender.clone(), profile.clone());
        }
    }

    fn classify(&self, channel: Channel, envelope: ChatEnvelope) -> Dispatch {
        let from_self = envelope.sender == self.local_user;

        if channel == Channel::Public {
            return match envelope.kind {
                EnvelopeKind::Join | EnvelopeKind::Leave => Dispatch::Notice(envelope),
                EnvelopeKind::Chat | EnvelopeKind::File if from_self => Dispatch::Suppressed,
                EnvelopeKind::Chat | EnvelopeKind::File => {
                    if envelope.receiver.as_ref().is_some_and(|r| *r != self.local_user) {
                        debug!(receiver = ?envelope.receiver, "Dropping envelope for another user");
                        return Dispatch::Dropped;
                    }
                    deliver(envelope)
                }
                EnvelopeKind::Users => {
                    debug!("Ignoring presence snapshot on public topic");
                    Dispatch::Dropped
                }
            };
        }

        if envelope.receiver.as_ref() != Some(&self.local_user) {
            debug!(
                channel = channel.destination(),
                receiver = ?envelope.receiver,
                "Dropping private envelope addressed to someone else"
            );
            return Dispatch::Dropped;
        }

        let expected = if channel == Channel::Private {
            EnvelopeKind::Chat
        } else {
            EnvelopeKind::File
        };
        if envelope.kind != expected {
            debug!(channel = channel.destination(), kind = ?envelope.kind, "Unexpected envelope kind");
            return Dispatch::Dropped;
        }
        deliver(envelope)
    }

    pub fn compose_chat(&self, content: impl Into<String>, receiver: Option<UserId>) -> ChatEnvelope {
        self.stamp(ChatEnvelope::chat(
            self.local_user.clone(),
            content,
            receiver,
        ))
    }

    pub fn compose_file(
        &self,
        file: FilePayload,
        caption: impl Into<String>,
        receiver: Option<UserId>,
    ) -> Result<ChatEnvelope, ProtocolError> {
        FilePayload::check_size(file.size_bytes)?;
        Ok(self.stamp(ChatEnvelope::file(
            self.local_user.clone(),
            file,
            caption,
            receiver,
        )))
    }

    pub fn compose_join(&self) -> ChatEnvelope {
        self.stamp(ChatEnvelope::join(self.local_user.clone()))
    }

    pub fn compose_leave(&self) -> ChatEnvelope {
        self.stamp(ChatEnvelope::leave(self.local_user.clone()))
    }

    fn stamp(&self, envelope: ChatEnvelope) -> ChatEnvelope {
        ChatEnvelope {
            timestamp: Utc::now(),
            ..envelope.with_profile(self.local_profile.clone())
        }
    }
}

fn deliver(envelope: ChatEnvelope) -> Dispatch {
    match envelope.kind {
        EnvelopeKind::File => match &envelope.file {
            Some(file) if file.is_loaded() => Dispatch::File(envelope),
            _ => Dispatch::FileUnavailable(envelope),
        },
        _ => Dispatch::Chat(envelope),
    }
}

fn dropped(channel: Channel, error: &ProtocolError) -> Dispatch {
    warn!(channel = channel.destination(), error = %error, "Dropping malformed message");
    Dispatch::Dropped
}

#[cfg(test)]
mod tests {
    use causerie_shared::CallSignal;

    use super::*;

    fn alice() -> UserId {
        UserId::from("alice")
    }

    fn bob() -> UserId {
        UserId::from("bob")
    }

    fn router() -> MessageRouter {
        MessageRouter::new(alice(), None)
    }

    fn json(envelope: &ChatEnvelope) -> String {
        envelope.to_json().unwrap()
    }

    #[test]
    fn test_presence_snapshot() {
        let mut router = router();
        let snapshot = ChatEnvelope::presence(&[alice(), bob()]);
        assert_eq!(
            router.route(Channel::Presence, &json(&snapshot)),
            Dispatch::Presence("alice,bob".into())
        );
    }

    #[test]
    fn test_join_and_leave_are_notices() {
        let mut router = router();
        let join = ChatEnvelope::join(bob());
        assert!(matches!(
            router.route(Channel::Public, &json(&join)),
            Dispatch::Notice(e) if e.content == "bob joined the chat"
        ));
        // Our own join is still a notice, not suppressed
        let own = ChatEnvelope::join(alice());
        assert!(matches!(
            router.route(Channel::Public, &json(&own)),
            Dispatch::Notice(_)
        ));
    }

    #[test]
    fn test_own_public_message_is_suppressed() {
        let mut router = router();
        let own = ChatEnvelope::chat(alice(), "hi all", None);
        assert_eq!(router.route(Channel::Public, &json(&own)), Dispatch::Suppressed);

        let theirs = ChatEnvelope::chat(bob(), "hello", None);
        assert!(matches!(
            router.route(Channel::Public, &json(&theirs)),
            Dispatch::Chat(e) if e.content == "hello"
        ));
    }

    #[test]
    fn test_private_messages_are_never_suppressed() {
        let mut router = router();
        // A private note to ourselves still arrives through the private queue
        let own = ChatEnvelope::chat(alice(), "memo", Some(alice()));
        assert!(matches!(
            router.route(Channel::Private, &json(&own)),
            Dispatch::Chat(_)
        ));
    }

    #[test]
    fn test_private_message_for_someone_else_is_dropped() {
        let mut router = router();
        let other = ChatEnvelope::chat(bob(), "psst", Some(UserId::from("carol")));
        assert_eq!(router.route(Channel::Private, &json(&other)), Dispatch::Dropped);
    }

    #[test]
    fn test_private_queues_only_accept_their_kind() {
        let mut router = router();
        let file = FilePayload::from_bytes("a.txt", "text/plain", b"x").unwrap();
        let file_env = ChatEnvelope::file(bob(), file, "", Some(alice()));
        assert_eq!(router.route(Channel::Private, &json(&file_env)), Dispatch::Dropped);
        assert!(matches!(
            router.route(Channel::PrivateFile, &json(&file_env)),
            Dispatch::File(_)
        ));
    }

    #[test]
    fn test_file_without_data_is_unavailable() {
        let mut router = router();
        let mut file = FilePayload::from_bytes("photo.png", "image/png", b"png").unwrap();
        file.data = None;
        let envelope = ChatEnvelope::file(bob(), file, "look", None);
        assert!(matches!(
            router.route(Channel::Public, &json(&envelope)),
            Dispatch::FileUnavailable(e) if e.file.as_ref().unwrap().name == "photo.png"
        ));
    }

    #[test]
    fn test_call_messages_pass_through() {
        let mut router = router();
        let msg = CallMessage::new(bob(), alice(), CallSignal::CallEnd);
        assert_eq!(
            router.route(Channel::Call, &msg.to_json().unwrap()),
            Dispatch::Call(msg)
        );
    }

    #[test]
    fn test_malformed_payload_does_not_poison_later_messages() {
        let mut router = router();
        assert_eq!(router.route(Channel::Public, "{not json"), Dispatch::Dropped);
        assert_eq!(router.route(Channel::Call, r#"{"type":"CALL_WAVE"}"#), Dispatch::Dropped);
        let ok = ChatEnvelope::chat(bob(), "still here", None);
        assert!(matches!(
            router.route(Channel::Public, &json(&ok)),
            Dispatch::Chat(_)
        ));
    }

    #[test]
    fn test_profile_cache_last_write_wins() {
        let mut router = router();
        let first = ProfileRef("data:image/png;base64,AAAA".into());
        let second = ProfileRef("data:image/png;base64,BBBB".into());

        let msg = ChatEnvelope::chat(bob(), "one", None).with_profile(Some(first));
        router.route(Channel::Public, &json(&msg));
        let msg = ChatEnvelope::chat(bob(), "two", None).with_profile(Some(second.clone()));
        router.route(Channel::Public, &json(&msg));
        assert_eq!(router.profile_of(&bob()), Some(&second));

        // Empty refs and our own envelopes leave the cache alone
        let msg = ChatEnvelope::chat(bob(), "three", None).with_profile(Some(ProfileRef(String::new())));
        router.route(Channel::Public, &json(&msg));
        assert_eq!(router.profile_of(&bob()), Some(&second));
        let own = ChatEnvelope::chat(alice(), "me", None)
            .with_profile(Some(ProfileRef("data:image/png;base64,CCCC".into())));
        router.route(Channel::Public, &json(&own));
        assert_eq!(router.profile_of(&alice()), None);
    }

    #[test]
    fn test_compose_attaches_profile_and_scope() {
        let profile = ProfileRef("data:image/png;base64,AAAA".into());
        let router = MessageRouter::new(alice(), Some(profile.clone()));

        let public = router.compose_chat("hi", None);
        assert!(public.is_public());
        assert_eq!(public.profile, Some(profile.clone()));

        let private = router.compose_chat("psst", Some(bob()));
        assert_eq!(private.receiver, Some(bob()));

        let join = router.compose_join();
        assert_eq!(join.kind, EnvelopeKind::Join);
        assert_eq!(router.compose_leave().content, "alice left the chat");
    }

    #[test]
    fn test_compose_file_rejects_oversize() {
        let router = router();
        let file = FilePayload {
            name: "huge.bin".into(),
            mime_type: "application/octet-stream".into(),
            size_bytes: causerie_shared::constants::MAX_FILE_SIZE + 1,
            data: Some("AAAA".into()),
        };
        assert!(matches!(
            router.compose_file(file, "", None),
            Err(ProtocolError::FileTooLarge { .. })
        ));
    }
}
