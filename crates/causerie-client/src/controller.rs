//! The controlling task.
//!
//! [`Client::run`] owns the session, router, call engine, transport and
//! media driver, and selects over user commands, broker notifications and
//! call events. Media work happens in per-call workers, so inbound
//! processing never waits on it.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use causerie_media::{CallAction, CallEngine, CallEvent, MediaBackend, MediaDriver};
use causerie_net::{Connector, SessionManager, TransportNotification};
use causerie_shared::{AppDestination, Channel, ConnectionState, ProfileRef, UserId};

use crate::commands::{self, files, messaging, profile, CallCommand, ClientCommand};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{emit_event, ClientEvent, ConnectionPayload, EventSink, PresencePayload};
use crate::router::{Dispatch, MessageRouter};
use crate::state::Session;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const CALL_EVENT_CHANNEL_CAPACITY: usize = 256;

/// The user interface's side of a running client.
pub struct ClientHandle {
    pub commands: mpsc::Sender<ClientCommand>,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub connection: watch::Receiver<ConnectionState>,
}

pub struct Client {
    session: Session,
    router: MessageRouter,
    calls: CallEngine,
    transport: SessionManager,
    media: MediaDriver,
    commands: mpsc::Receiver<ClientCommand>,
    call_events: mpsc::Receiver<CallEvent>,
    events: EventSink,
    transport_state: watch::Receiver<ConnectionState>,
}

enum Flow {
    Continue,
    Stop,
}

impl Client {
    pub fn new(
        config: &ClientConfig,
        local_user: UserId,
        profile: Option<ProfileRef>,
        connector: Box<dyn Connector>,
        backend: Arc<dyn MediaBackend>,
    ) -> (Self, ClientHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (call_event_tx, call_events) = mpsc::channel(CALL_EVENT_CHANNEL_CAPACITY);

        let transport =
            SessionManager::new(connector, local_user.clone(), config.session_config());
        let handle = ClientHandle {
            commands: command_tx,
            events: event_rx,
            connection: transport.watch_state(),
        };
        let transport_state = transport.watch_state();

        let client = Self {
            router: MessageRouter::new(local_user.clone(), profile.clone()),
            calls: CallEngine::with_ring_timeout(local_user.clone(), config.ring_timeout),
            session: Session::new(local_user, profile),
            transport,
            media: MediaDriver::new(backend, call_event_tx),
            commands,
            call_events,
            events: event_tx,
            transport_state,
        };
        (client, handle)
    }

    /// Join the chat and process events until the user leaves or the
    /// command channel closes.
    pub async fn run(mut self) -> Result<(), ClientError> {
        info!(user = %self.session.local_user, "Client starting");
        let result = self.run_loop().await;
        self.media.shutdown();
        self.session.active_peers.clear();
        info!(user = %self.session.local_user, "Client stopped");
        result
    }

    async fn run_loop(&mut self) -> Result<(), ClientError> {
        if let Flow::Stop = self.establish(false).await? {
            return Ok(());
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(ClientCommand::Leave) => {
                        self.leave().await;
                        return Ok(());
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                notification = self.transport.next_notification() => match notification {
                    Some(TransportNotification::MessageReceived { channel, body }) => {
                        self.handle_inbound(channel, &body).await;
                    }
                    Some(TransportNotification::Closed { reason }) => {
                        warn!(reason = %reason, "Connection lost");
                        if let Flow::Stop = self.establish(true).await? {
                            return Ok(());
                        }
                    }
                    None => {
                        warn!("Connection task ended");
                        if let Flow::Stop = self.establish(true).await? {
                            return Ok(());
                        }
                    }
                },
                Some(event) = self.call_events.recv() => self.handle_call_event(event).await,
            }
        }
    }

    /// Connect (or reconnect) and join. Commands that need the broker are
    /// refused meanwhile. A call in progress can still be ended locally, and
    /// `Leave` abandons the attempt.
    async fn establish(&mut self, reconnect: bool) -> Result<Flow, ClientError> {
        self.set_connection(if reconnect {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connecting
        });

        {
            let join = self.router.compose_join();
            let transport = &mut self.transport;
            let transport_state = &mut self.transport_state;
            let commands = &mut self.commands;
            let call_events = &mut self.call_events;
            let calls = &mut self.calls;
            let media = &mut self.media;
            let session = &mut self.session;
            let events = &self.events;
            transport_state.borrow_and_update();
            let attempt = async move {
                if reconnect {
                    transport.reconnect(&join).await
                } else {
                    transport.connect(&join).await
                }
            };
            tokio::pin!(attempt);

            loop {
                tokio::select! {
                    result = &mut attempt => {
                        result?;
                        break;
                    }
                    Ok(()) = transport_state.changed() => {
                        // Connected is reported once the join is out
                        let state = *transport_state.borrow_and_update();
                        if state != ConnectionState::Connected && session.connection != state {
                            session.connection = state;
                            let event = ClientEvent::ConnectionChanged(ConnectionPayload { state });
                            emit_event(events, event);
                        }
                    }
                    cmd = commands.recv() => match cmd {
                        None | Some(ClientCommand::Leave) => {
                            info!("Leaving while disconnected");
                            let actions = calls.hangup();
                            carry_out(actions, None, media, events).await;
                            return Ok(Flow::Stop);
                        }
                        Some(ClientCommand::Call(
                            cmd @ (CallCommand::Hangup | CallCommand::Reject | CallCommand::Mute(_)),
                        )) => match calls.handle(cmd.into()) {
                            Ok(actions) => carry_out(actions, None, media, events).await,
                            Err(e) => emit_event(events, ClientEvent::error(e)),
                        },
                        Some(cmd) => {
                            debug!(command = ?cmd, "Command refused while connecting");
                            emit_event(events, ClientEvent::error("Not connected to server"));
                        }
                    },
                    Some(event) = call_events.recv() => match calls.handle(event) {
                        Ok(actions) => carry_out(actions, None, media, events).await,
                        Err(e) => debug!(error = %e, "Call event ignored"),
                    },
                }
            }
        }

        self.set_connection(ConnectionState::Connected);
        Ok(Flow::Continue)
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.session.connection != state {
            self.session.connection = state;
            self.emit(ClientEvent::ConnectionChanged(ConnectionPayload { state }));
        }
    }

    async fn leave(&mut self) {
        // Hang up first so the peer hears CALL_END before our LEAVE
        let actions = self.calls.hangup();
        self.perform(actions).await;

        let leave = self.router.compose_leave();
        if let Err(e) = self.transport.leave(&leave).await {
            warn!(error = %e, "Failed to announce departure");
        }
        self.set_connection(ConnectionState::Disconnected);
    }

    fn emit(&self, event: ClientEvent) {
        emit_event(&self.events, event);
    }

    // -----------------------------------------------------------------------
    // User commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: ClientCommand) {
        if let Err(e) = self.run_command(cmd).await {
            debug!(error = %e, "Command failed");
            self.emit(ClientEvent::error(e));
        }
    }

    async fn run_command(&mut self, cmd: ClientCommand) -> Result<(), ClientError> {
        match cmd {
            ClientCommand::SendMessage { content, to } => {
                let envelope =
                    messaging::send_message(&self.transport, &self.router, &content, to).await?;
                self.emit(ClientEvent::message(envelope, true));
            }
            ClientCommand::SendFile { path, caption, to } => {
                let envelope =
                    files::send_file(&self.transport, &self.router, &path, &caption, to).await?;
                if let Some(event) = ClientEvent::file(envelope, true) {
                    self.emit(event);
                }
            }
            ClientCommand::SetProfileImage(path) => {
                let profile = profile::load_profile_image(&path).await?;
                self.router.set_local_profile(Some(profile.clone()));
                self.session.profile = Some(profile);
                self.emit(ClientEvent::notice("Profile picture updated"));
            }
            ClientCommand::Call(cmd) => self.handle_call_command(cmd).await?,
            ClientCommand::Leave => {}
        }
        Ok(())
    }

    async fn handle_call_command(&mut self, cmd: CallCommand) -> Result<(), ClientError> {
        if let CallCommand::Start(peer) = &cmd {
            commands::media::check_callable(
                &self.session.active_peers,
                &self.session.local_user,
                peer,
            )?;
        }
        let actions = self.calls.handle(cmd.into())?;
        self.perform(actions).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound traffic
    // -----------------------------------------------------------------------

    async fn handle_inbound(&mut self, channel: Channel, body: &str) {
        match self.router.route(channel, body) {
            Dispatch::Presence(raw) => {
                let members = self.session.active_peers.update(&raw);
                self.calls.observe_presence(members);
                let users = members.iter().cloned().collect();
                self.emit(ClientEvent::PresenceChanged(PresencePayload { users }));
            }
            Dispatch::Notice(envelope) => self.emit(ClientEvent::notice(envelope.content)),
            Dispatch::Chat(envelope) => self.emit(ClientEvent::message(envelope, false)),
            Dispatch::File(envelope) => {
                if let Some(event) = ClientEvent::file(envelope, false) {
                    self.emit(event);
                }
            }
            Dispatch::FileUnavailable(envelope) => {
                let name = envelope
                    .file
                    .as_ref()
                    .map(|f| f.name.as_str())
                    .unwrap_or("attachment");
                self.emit(ClientEvent::notice(format!("File \"{name}\" could not be loaded")));
            }
            Dispatch::Call(msg) => {
                let actions = self.calls.on_signal(msg);
                self.perform(actions).await;
            }
            Dispatch::Suppressed | Dispatch::Dropped => {}
        }
    }

    async fn handle_call_event(&mut self, event: CallEvent) {
        match self.calls.handle(event) {
            Ok(actions) => self.perform(actions).await,
            Err(e) => debug!(error = %e, "Call event ignored"),
        }
    }

    async fn perform(&mut self, actions: Vec<CallAction>) {
        carry_out(actions, Some(&self.transport), &mut self.media, &self.events).await;
    }
}

/// Carry out engine actions in order: signaling goes to the broker,
/// notices to the UI, everything else to the media driver. Without a
/// transport, signaling is dropped and local teardown still happens.
async fn carry_out(
    actions: Vec<CallAction>,
    transport: Option<&SessionManager>,
    media: &mut MediaDriver,
    events: &EventSink,
) {
    for action in actions {
        match action {
            CallAction::Send(msg) => {
                let signal = msg.signal.name();
                let Some(transport) = transport else {
                    debug!(signal, "Not connected, call message dropped");
                    continue;
                };
                let sent = match msg.to_json() {
                    Ok(body) => transport
                        .publish(AppDestination::CallMessage, body)
                        .await
                        .map_err(ClientError::from),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    warn!(signal, error = %e, "Failed to send call message");
                }
            }
            CallAction::Notify(notice) => emit_event(events, ClientEvent::from(notice)),
            other => media.apply(other),
        }
    }
}
