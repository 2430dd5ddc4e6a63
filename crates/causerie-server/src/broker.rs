//! Presence registry and message routing.
//!
//! Each WebSocket connection registers an outbox. A connection becomes a
//! chat member by joining under a user name; several connections may be
//! bound to the same name, and the name stays in the presence list until
//! the last of them leaves or drops.

use std::collections::{BTreeSet, HashMap, HashSet};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use causerie_net::{ClientFrame, ServerFrame};
use causerie_shared::{
    AppDestination, CallMessage, Channel, ChatEnvelope, EnvelopeKind, FilePayload, UserId,
};

use crate::error::BrokerError;

pub type ConnId = Uuid;

struct Connection {
    user: Option<UserId>,
    subscriptions: HashSet<Channel>,
    outbox: mpsc::UnboundedSender<ServerFrame>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnId, Connection>,
    active_users: BTreeSet<UserId>,
}

impl Registry {
    /// Check that `claimed` is the user this connection joined as.
    fn check_sender(&self, conn: ConnId, claimed: &UserId) -> Result<(), BrokerError> {
        match self.connections.get(&conn).and_then(|c| c.user.as_ref()) {
            None => Err(BrokerError::NotJoined),
            Some(bound) if bound != claimed => Err(BrokerError::SenderMismatch {
                bound: bound.clone(),
                claimed: claimed.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn check_receiver(&self, receiver: &UserId) -> Result<(), BrokerError> {
        if self.active_users.contains(receiver) {
            Ok(())
        } else {
            Err(BrokerError::UnknownReceiver(receiver.clone()))
        }
    }

    fn push(connection: &Connection, channel: Channel, body: &str) {
        if !connection.subscriptions.contains(&channel) {
            return;
        }
        let _ = connection.outbox.send(ServerFrame::Message {
            destination: channel.destination().to_string(),
            body: body.to_string(),
        });
    }

    fn broadcast(&self, channel: Channel, body: &str) {
        for connection in self.connections.values() {
            if connection.user.is_some() {
                Self::push(connection, channel, body);
            }
        }
    }

    fn deliver_to_user(&self, user: &UserId, channel: Channel, body: &str) {
        for connection in self.connections.values() {
            if connection.user.as_ref() == Some(user) {
                Self::push(connection, channel, body);
            }
        }
    }

    fn deliver_to_conn(&self, conn: ConnId, channel: Channel, body: &str) {
        if let Some(connection) = self.connections.get(&conn) {
            Self::push(connection, channel, body);
        }
    }

    fn reply(&self, conn: ConnId, frame: ServerFrame) {
        if let Some(connection) = self.connections.get(&conn) {
            let _ = connection.outbox.send(frame);
        }
    }

    fn presence_body(&self) -> Option<String> {
        match ChatEnvelope::presence(&self.active_users).to_json() {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(error = %e, "Failed to encode presence snapshot");
                None
            }
        }
    }

    fn publish_presence(&self) {
        if let Some(body) = self.presence_body() {
            self.broadcast(Channel::Presence, &body);
        }
    }

    /// Unbind the connection's user. Returns the user when it was their
    /// last bound connection, after dropping them from the presence list.
    fn unbind(&mut self, conn: ConnId) -> Option<UserId> {
        let user = self.connections.get_mut(&conn)?.user.take()?;
        let still_bound = self
            .connections
            .values()
            .any(|c| c.user.as_ref() == Some(&user));
        if still_bound {
            debug!(user = %user, conn = %conn, "Connection unbound, user still present");
            return None;
        }
        self.active_users.remove(&user);
        Some(user)
    }

    /// Announce a departure and refresh everyone's presence list.
    fn announce_departure(&self, user: UserId) {
        info!(user = %user, "User left");
        match ChatEnvelope::leave(user).to_json() {
            Ok(body) => self.broadcast(Channel::Public, &body),
            Err(e) => warn!(error = %e, "Failed to encode leave notice"),
        }
        self.publish_presence();
    }
}

/// Routes client frames between connections.
pub struct Broker {
    instance_name: String,
    registry: Mutex<Registry>,
}

impl Broker {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Register a new connection. Frames for it arrive on the returned
    /// receiver until [`Broker::disconnect`] is called.
    pub async fn register(&self) -> (ConnId, mpsc::UnboundedReceiver<ServerFrame>) {
        let (outbox, frames) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.registry.lock().await.connections.insert(
            id,
            Connection {
                user: None,
                subscriptions: HashSet::new(),
                outbox,
            },
        );
        debug!(conn = %id, "Connection registered");
        (id, frames)
    }

    /// Handle one frame from `conn`. Returns `false` when the client asked
    /// to disconnect.
    pub async fn handle_frame(&self, conn: ConnId, frame: ClientFrame) -> bool {
        let result = match frame {
            ClientFrame::Connect { client } => {
                debug!(conn = %conn, client = %client, "Client handshake");
                self.registry.lock().await.reply(
                    conn,
                    ServerFrame::Connected {
                        server: self.instance_name.clone(),
                    },
                );
                Ok(())
            }
            ClientFrame::Subscribe { destination } => self.subscribe(conn, &destination).await,
            ClientFrame::Send { destination, body } => {
                self.dispatch(conn, &destination, &body).await
            }
            ClientFrame::Disconnect => return false,
        };

        if let Err(e) = result {
            warn!(conn = %conn, error = %e, "Frame refused");
            self.report_error(conn, e.to_string()).await;
        }
        true
    }

    /// Tell `conn` that one of its frames was refused.
    pub async fn report_error(&self, conn: ConnId, message: String) {
        self.registry
            .lock()
            .await
            .reply(conn, ServerFrame::Error { message });
    }

    pub async fn subscribe(&self, conn: ConnId, destination: &str) -> Result<(), BrokerError> {
        let channel = Channel::from_destination(destination)
            .ok_or_else(|| BrokerError::UnknownChannel(destination.to_string()))?;
        if let Some(connection) = self.registry.lock().await.connections.get_mut(&conn) {
            connection.subscriptions.insert(channel);
        }
        Ok(())
    }

    /// Run an application action on behalf of `conn`.
    pub async fn dispatch(
        &self,
        conn: ConnId,
        destination: &str,
        body: &str,
    ) -> Result<(), BrokerError> {
        match AppDestination::from_path(destination)? {
            AppDestination::SendMessage => {
                let envelope = ChatEnvelope::from_json(body)?;
                expect_kind(AppDestination::SendMessage, &envelope, EnvelopeKind::Chat)?;
                self.route_envelope(conn, envelope, Channel::Private).await
            }
            AppDestination::SendFile => {
                let envelope = ChatEnvelope::from_json(body)?;
                expect_kind(AppDestination::SendFile, &envelope, EnvelopeKind::File)?;
                if let Some(file) = &envelope.file {
                    FilePayload::check_size(file.size_bytes)?;
                }
                self.route_envelope(conn, envelope, Channel::PrivateFile).await
            }
            AppDestination::AddUser => self.join(conn, ChatEnvelope::from_json(body)?).await,
            AppDestination::Leave => self.leave(conn, ChatEnvelope::from_json(body)?).await,
            AppDestination::CallMessage => {
                self.route_call(conn, CallMessage::from_json(body)?).await
            }
        }
    }

    /// Public envelopes go to the public topic, private ones to the
    /// receiver's `private_channel` only.
    async fn route_envelope(
        &self,
        conn: ConnId,
        envelope: ChatEnvelope,
        private_channel: Channel,
    ) -> Result<(), BrokerError> {
        let registry = self.registry.lock().await;
        registry.check_sender(conn, &envelope.sender)?;
        let body = envelope.to_json()?;

        match &envelope.receiver {
            None => {
                debug!(envelope = %envelope, "Broadcasting");
                registry.broadcast(Channel::Public, &body);
            }
            Some(receiver) => {
                registry.check_receiver(receiver)?;
                debug!(envelope = %envelope, "Delivering privately");
                registry.deliver_to_user(receiver, private_channel, &body);
            }
        }
        Ok(())
    }

    async fn route_call(&self, conn: ConnId, message: CallMessage) -> Result<(), BrokerError> {
        let registry = self.registry.lock().await;
        registry.check_sender(conn, &message.sender)?;
        registry.check_receiver(&message.receiver)?;
        debug!(
            signal = message.signal.name(),
            from = %message.sender,
            to = %message.receiver,
            "Forwarding call message"
        );
        registry.deliver_to_user(&message.receiver, Channel::Call, &message.to_json()?);
        Ok(())
    }

    async fn join(&self, conn: ConnId, envelope: ChatEnvelope) -> Result<(), BrokerError> {
        let user = UserId::parse(envelope.sender.as_str())?;
        let mut registry = self.registry.lock().await;

        let Some(connection) = registry.connections.get_mut(&conn) else {
            return Ok(());
        };
        if let Some(bound) = &connection.user {
            if *bound != user {
                return Err(BrokerError::SenderMismatch {
                    bound: bound.clone(),
                    claimed: user,
                });
            }
        }
        connection.user = Some(user.clone());

        if !registry.active_users.insert(user.clone()) {
            // Already present through another connection: this one only
            // needs to catch up on the presence list.
            debug!(user = %user, conn = %conn, "Additional connection joined");
            if let Some(body) = registry.presence_body() {
                registry.deliver_to_conn(conn, Channel::Presence, &body);
            }
            return Ok(());
        }

        info!(user = %user, "User joined");
        let notice = ChatEnvelope::join(user).with_profile(envelope.profile);
        registry.broadcast(Channel::Public, &notice.to_json()?);
        registry.publish_presence();
        Ok(())
    }

    async fn leave(&self, conn: ConnId, envelope: ChatEnvelope) -> Result<(), BrokerError> {
        let mut registry = self.registry.lock().await;
        registry.check_sender(conn, &envelope.sender)?;
        if let Some(user) = registry.unbind(conn) {
            registry.announce_departure(user);
        }
        Ok(())
    }

    /// Forget a connection. A user whose last connection this was leaves
    /// the chat.
    pub async fn disconnect(&self, conn: ConnId) {
        let mut registry = self.registry.lock().await;
        let departed = registry.unbind(conn);
        registry.connections.remove(&conn);
        debug!(conn = %conn, "Connection closed");
        if let Some(user) = departed {
            registry.announce_departure(user);
        }
    }

    /// Users currently in the chat, sorted.
    pub async fn active_users(&self) -> Vec<UserId> {
        self.registry.lock().await.active_users.iter().cloned().collect()
    }

    pub async fn is_active(&self, user: &UserId) -> bool {
        self.registry.lock().await.active_users.contains(user)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.connections.len()
    }
}

fn expect_kind(
    destination: AppDestination,
    envelope: &ChatEnvelope,
    kind: EnvelopeKind,
) -> Result<(), BrokerError> {
    if envelope.kind == kind {
        Ok(())
    } else {
        Err(BrokerError::WrongKind {
            destination: destination.path(),
            kind: format!("{:?}", envelope.kind).to_uppercase(),
        })
    }
}

#[cfg(test)]
mod tests {
    use causerie_shared::{CallSignal, RejectReason};

    use super::*;

    struct Client {
        id: ConnId,
        frames: mpsc::UnboundedReceiver<ServerFrame>,
    }

    impl Client {
        /// Drain everything queued so far as (channel, envelope body).
        fn drain(&mut self) -> Vec<(Channel, String)> {
            let mut out = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                if let ServerFrame::Message { destination, body } = frame {
                    out.push((Channel::from_destination(&destination).unwrap(), body));
                }
            }
            out
        }

        fn drain_errors(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                if let ServerFrame::Error { message } = frame {
                    out.push(message);
                }
            }
            out
        }
    }

    async fn connect(broker: &Broker) -> Client {
        let (id, frames) = broker.register().await;
        for channel in Channel::ALL {
            broker.subscribe(id, channel.destination()).await.unwrap();
        }
        Client { id, frames }
    }

    async fn join(broker: &Broker, client: &mut Client, name: &str) {
        let body = ChatEnvelope::join(UserId::from(name)).to_json().unwrap();
        broker
            .dispatch(client.id, AppDestination::AddUser.path(), &body)
            .await
            .unwrap();
    }

    fn envelopes(messages: &[(Channel, String)], channel: Channel) -> Vec<ChatEnvelope> {
        messages
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, body)| ChatEnvelope::from_json(body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_join_broadcasts_notice_and_presence() {
        let broker = Broker::new("test");
        let mut alice = connect(&broker).await;
        let mut bob = connect(&broker).await;

        join(&broker, &mut alice, "alice").await;
        join(&broker, &mut bob, "bob").await;

        let seen = alice.drain();
        let public = envelopes(&seen, Channel::Public);
        assert_eq!(public.last().unwrap().kind, EnvelopeKind::Join);
        assert_eq!(public.last().unwrap().content, "bob joined the chat");

        let presence = envelopes(&seen, Channel::Presence);
        assert_eq!(presence.last().unwrap().content, "alice,bob");
        assert_eq!(presence.last().unwrap().sender.as_str(), "System");

        assert_eq!(
            broker.active_users().await,
            vec![UserId::from("alice"), UserId::from("bob")]
        );
    }

    #[tokio::test]
    async fn test_second_connection_for_same_user_gets_snapshot_only() {
        let broker = Broker::new("test");
        let mut first = connect(&broker).await;
        join(&broker, &mut first, "alice").await;
        first.drain();

        let mut second = connect(&broker).await;
        join(&broker, &mut second, "alice").await;

        assert!(first.drain().is_empty());
        let seen = second.drain();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Channel::Presence);

        // Dropping one of the two keeps alice present
        broker.disconnect(first.id).await;
        assert!(broker.is_active(&UserId::from("alice")).await);
        broker.disconnect(second.id).await;
        assert!(!broker.is_active(&UserId::from("alice")).await);
    }

    #[tokio::test]
    async fn test_private_message_reaches_receiver_only() {
        let broker = Broker::new("test");
        let mut alice = connect(&broker).await;
        let mut bob = connect(&broker).await;
        let mut carol = connect(&broker).await;
        join(&broker, &mut alice, "alice").await;
        join(&broker, &mut bob, "bob").await;
        join(&broker, &mut carol, "carol").await;
        alice.drain();
        bob.drain();
        carol.drain();

        let dm = ChatEnvelope::chat(UserId::from("alice"), "psst", Some(UserId::from("bob")));
        broker
            .dispatch(alice.id, AppDestination::SendMessage.path(), &dm.to_json().unwrap())
            .await
            .unwrap();

        let got = bob.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Channel::Private);
        assert_eq!(ChatEnvelope::from_json(&got[0].1).unwrap().content, "psst");
        assert!(alice.drain().is_empty());
        assert!(carol.drain().is_empty());
    }

    #[tokio::test]
    async fn test_public_message_reaches_everyone() {
        let broker = Broker::new("test");
        let mut alice = connect(&broker).await;
        let mut bob = connect(&broker).await;
        join(&broker, &mut alice, "alice").await;
        join(&broker, &mut bob, "bob").await;
        alice.drain();
        bob.drain();

        let msg = ChatEnvelope::chat(UserId::from("alice"), "hello", None);
        broker
            .dispatch(alice.id, AppDestination::SendMessage.path(), &msg.to_json().unwrap())
            .await
            .unwrap();

        for client in [&mut alice, &mut bob] {
            let got = client.drain();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].0, Channel::Public);
        }
    }

    #[tokio::test]
    async fn test_private_file_uses_file_queue() {
        let broker = Broker::new("test");
        let mut alice = connect(&broker).await;
        let mut bob = connect(&broker).await;
        join(&broker, &mut alice, "alice").await;
        join(&broker, &mut bob, "bob").await;
        bob.drain();

        let file = FilePayload::from_bytes("a.txt", "text/plain", b"hi").unwrap();
        let envelope =
            ChatEnvelope::file(UserId::from("alice"), file, "", Some(UserId::from("bob")));
        broker
            .dispatch(alice.id, AppDestination::SendFile.path(), &envelope.to_json().unwrap())
            .await
            .unwrap();

        let got = bob.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Channel::PrivateFile);
    }

    #[tokio::test]
    async fn test_refusals() {
        let broker = Broker::new("test");
        let mut alice = connect(&broker).await;

        let msg = ChatEnvelope::chat(UserId::from("alice"), "early", None);
        let err = broker
            .dispatch(alice.id, AppDestination::SendMessage.path(), &msg.to_json().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotJoined));

        join(&broker, &mut alice, "alice").await;

        let spoof = ChatEnvelope::chat(UserId::from("mallory"), "hi", None);
        let err = broker
            .dispatch(alice.id, AppDestination::SendMessage.path(), &spoof.to_json().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::SenderMismatch { .. }));

        let dm = ChatEnvelope::chat(UserId::from("alice"), "hi", Some(UserId::from("ghost")));
        let err = broker
            .dispatch(alice.id, AppDestination::SendMessage.path(), &dm.to_json().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownReceiver(_)));

        let join_as_chat = ChatEnvelope::join(UserId::from("alice"));
        let err = broker
            .dispatch(
                alice.id,
                AppDestination::SendMessage.path(),
                &join_as_chat.to_json().unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::WrongKind { .. }));

        assert!(broker.subscribe(alice.id, "/topic/secret").await.is_err());
    }

    #[tokio::test]
    async fn test_refused_frame_reports_error_and_keeps_socket() {
        let broker = Broker::new("test");
        let mut alice = connect(&broker).await;
        let keep_open = broker
            .handle_frame(
                alice.id,
                ClientFrame::Send {
                    destination: "/app/nope".into(),
                    body: "{}".into(),
                },
            )
            .await;
        assert!(keep_open);
        assert_eq!(alice.drain_errors().len(), 1);

        assert!(!broker.handle_frame(alice.id, ClientFrame::Disconnect).await);
    }

    #[tokio::test]
    async fn test_call_message_forwarded_to_call_queue() {
        let broker = Broker::new("test");
        let mut alice = connect(&broker).await;
        let mut bob = connect(&broker).await;
        join(&broker, &mut alice, "alice").await;
        join(&broker, &mut bob, "bob").await;
        bob.drain();

        let reject = CallMessage::new(
            UserId::from("alice"),
            UserId::from("bob"),
            CallSignal::CallReject {
                reason: RejectReason::Busy,
            },
        );
        broker
            .dispatch(alice.id, AppDestination::CallMessage.path(), &reject.to_json().unwrap())
            .await
            .unwrap();

        let got = bob.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Channel::Call);
        assert_eq!(CallMessage::from_json(&got[0].1).unwrap(), reject);
    }

    #[tokio::test]
    async fn test_disconnect_announces_leave() {
        let broker = Broker::new("test");
        let mut alice = connect(&broker).await;
        let mut bob = connect(&broker).await;
        join(&broker, &mut alice, "alice").await;
        join(&broker, &mut bob, "bob").await;
        alice.drain();

        broker.disconnect(bob.id).await;

        let seen = alice.drain();
        let public = envelopes(&seen, Channel::Public);
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].kind, EnvelopeKind::Leave);
        assert_eq!(public[0].content, "bob left the chat");
        assert_eq!(envelopes(&seen, Channel::Presence)[0].content, "alice");
        assert_eq!(broker.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_explicit_leave_keeps_connection() {
        let broker = Broker::new("test");
        let mut alice = connect(&broker).await;
        join(&broker, &mut alice, "alice").await;

        let body = ChatEnvelope::leave(UserId::from("alice")).to_json().unwrap();
        broker
            .dispatch(alice.id, AppDestination::Leave.path(), &body)
            .await
            .unwrap();

        assert!(broker.active_users().await.is_empty());
        assert_eq!(broker.connection_count().await, 1);
        // Rejoining under another name is allowed once unbound
        join(&broker, &mut alice, "alicia").await;
        assert!(broker.is_active(&UserId::from("alicia")).await);
    }
}
