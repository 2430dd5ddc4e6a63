//! Session lifecycle on top of a broker connection.
//!
//! A session is connected, subscribed to every channel, and only then
//! announces the user. Lost connections are retried on a fixed delay.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use causerie_shared::constants::RECONNECT_DELAY_SECS;
use causerie_shared::{AppDestination, Channel, ChatEnvelope, ConnectionState, UserId};

use crate::connection::{Connector, TransportCommand, TransportLink, TransportNotification};
use crate::error::NetError;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pause between connection attempts.
    pub reconnect_delay: Duration,
    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            max_attempts: None,
        }
    }
}

pub struct SessionManager {
    connector: Box<dyn Connector>,
    local_user: UserId,
    config: SessionConfig,
    link: Option<TransportLink>,
    state_tx: watch::Sender<ConnectionState>,
}

impl SessionManager {
    pub fn new(connector: Box<dyn Connector>, local_user: UserId, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            local_user,
            config,
            link: None,
            state_tx,
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Follow connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Connect, subscribe to all channels and announce `join`.
    ///
    /// Failed attempts are retried after `reconnect_delay` until one
    /// succeeds or `max_attempts` is reached.
    pub async fn connect(&mut self, join: &ChatEnvelope) -> Result<(), NetError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.set_state(ConnectionState::Connecting);

            match self.try_establish(join).await {
                Ok(()) => {
                    info!(user = %self.local_user, attempt, "Session established");
                    return Ok(());
                }
                Err(e) => {
                    self.link = None;
                    self.set_state(ConnectionState::Disconnected);
                    if self
                        .config
                        .max_attempts
                        .is_some_and(|max| attempt >= max)
                    {
                        warn!(attempt, error = %e, "Connection failed, giving up");
                        return Err(NetError::RetriesExhausted { attempts: attempt });
                    }
                    warn!(
                        attempt,
                        error = %e,
                        delay_secs = self.config.reconnect_delay.as_secs(),
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// Drop the current link and run [`connect`](Self::connect) again.
    pub async fn reconnect(&mut self, join: &ChatEnvelope) -> Result<(), NetError> {
        self.mark_lost();
        tokio::time::sleep(self.config.reconnect_delay).await;
        self.connect(join).await
    }

    async fn try_establish(&mut self, join: &ChatEnvelope) -> Result<(), NetError> {
        let link = self.connector.connect().await?;
        self.set_state(ConnectionState::Connected);
        self.link = Some(link);
        self.subscribe_all().await?;
        self.join(join).await
    }

    async fn subscribe_all(&self) -> Result<(), NetError> {
        for channel in Channel::ALL {
            self.command(TransportCommand::Subscribe(channel)).await?;
            debug!(destination = channel.destination(), "Subscribed");
        }
        Ok(())
    }

    async fn join(&self, join: &ChatEnvelope) -> Result<(), NetError> {
        self.publish(AppDestination::AddUser, join.to_json()?).await
    }

    /// Announce departure and close the connection.
    pub async fn leave(&mut self, leave: &ChatEnvelope) -> Result<(), NetError> {
        if self.link.is_none() {
            return Ok(());
        }
        let result = self.publish(AppDestination::Leave, leave.to_json()?).await;
        let _ = self.command(TransportCommand::Shutdown).await;
        self.link = None;
        self.set_state(ConnectionState::Disconnected);
        info!(user = %self.local_user, "Left the chat");
        result
    }

    /// Send an encoded body to an application action.
    pub async fn publish(&self, destination: AppDestination, body: String) -> Result<(), NetError> {
        self.command(TransportCommand::Publish { destination, body })
            .await
    }

    async fn command(&self, cmd: TransportCommand) -> Result<(), NetError> {
        let link = self.link.as_ref().ok_or(NetError::NotConnected)?;
        link.commands.send(cmd).await.map_err(|_| NetError::Closed)
    }

    /// Next notification from the live link. Pends forever while
    /// disconnected. `None` means the link task went away.
    pub async fn next_notification(&mut self) -> Option<TransportNotification> {
        match self.link.as_mut() {
            Some(link) => link.notifications.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Forget the current link after the transport reported it gone.
    pub fn mark_lost(&mut self) {
        self.link = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "Connection state changed");
            *current = state;
            true
        });
    }
}
