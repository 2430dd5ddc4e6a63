//! Broker link with tokio mpsc command/notification pattern.
//!
//! Each live connection runs a socket loop in its own tokio task. The
//! session layer drives it through typed command and notification
//! channels and never touches the socket directly.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use causerie_shared::constants::{APP_NAME, HANDSHAKE_TIMEOUT_SECS};
use causerie_shared::{AppDestination, Channel};

use crate::error::NetError;
use crate::frame::{ClientFrame, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the socket task.
#[derive(Debug)]
pub enum TransportCommand {
    /// Subscribe to one of the logical channels.
    Subscribe(Channel),
    /// Invoke an application action with an encoded JSON body.
    Publish {
        destination: AppDestination,
        body: String,
    },
    /// Say goodbye and close the socket.
    Shutdown,
}

/// Notifications sent *from* the socket task to the session.
#[derive(Debug, Clone)]
pub enum TransportNotification {
    /// A message arrived on a subscribed channel.
    MessageReceived { channel: Channel, body: String },
    /// The socket is gone. No further notifications follow.
    Closed { reason: String },
}

/// Handle on one live connection.
pub struct TransportLink {
    pub commands: mpsc::Sender<TransportCommand>,
    pub notifications: mpsc::Receiver<TransportNotification>,
}

impl TransportLink {
    /// Build a link pair. The second half belongs to whoever services the
    /// connection.
    pub fn pair() -> (
        Self,
        (
            mpsc::Receiver<TransportCommand>,
            mpsc::Sender<TransportNotification>,
        ),
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (notif_tx, notif_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                commands: cmd_tx,
                notifications: notif_rx,
            },
            (cmd_rx, notif_tx),
        )
    }
}

/// Opens connections to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TransportLink, NetError>;
}

// ---------------------------------------------------------------------------
// WebSocket connector
// ---------------------------------------------------------------------------

pub struct WsConnector {
    url: String,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<TransportLink, NetError> {
        let (ws, _response) =
            tokio::time::timeout(self.handshake_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| NetError::HandshakeTimeout)??;
        let (mut sink, mut stream) = ws.split();

        send_frame(
            &mut sink,
            &ClientFrame::Connect {
                client: APP_NAME.to_string(),
            },
        )
        .await?;

        let server = tokio::time::timeout(self.handshake_timeout, await_handshake(&mut stream))
            .await
            .map_err(|_| NetError::HandshakeTimeout)??;
        info!(url = %self.url, server = %server, "Connected to broker");

        let (link, (mut cmd_rx, notif_tx)) = TransportLink::pair();

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let frame = match cmd {
                            Some(TransportCommand::Subscribe(channel)) => ClientFrame::Subscribe {
                                destination: channel.destination().to_string(),
                            },
                            Some(TransportCommand::Publish { destination, body }) => ClientFrame::Send {
                                destination: destination.path().to_string(),
                                body,
                            },
                            Some(TransportCommand::Shutdown) | None => {
                                debug!("Closing broker socket");
                                let _ = send_frame(&mut sink, &ClientFrame::Disconnect).await;
                                let _ = sink.close().await;
                                // Nobody is listening for a Closed notification
                                // after a requested shutdown.
                                return;
                            }
                        };
                        if let Err(e) = send_frame(&mut sink, &frame).await {
                            error!(error = %e, "Failed to write frame");
                            break e.to_string();
                        }
                    }

                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => handle_server_frame(&text, &notif_tx).await,
                            Some(Ok(Message::Close(frame))) => {
                                break frame
                                    .map(|f| f.reason.to_string())
                                    .unwrap_or_else(|| "closed by broker".to_string());
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break e.to_string(),
                            None => break "stream ended".to_string(),
                        }
                    }
                }
            };

            warn!(reason = %reason, "Broker connection lost");
            let _ = notif_tx
                .send(TransportNotification::Closed { reason })
                .await;
        });

        Ok(link)
    }
}

async fn await_handshake(stream: &mut SplitStream<WsStream>) -> Result<String, NetError> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => match ServerFrame::decode(&text)? {
                ServerFrame::Connected { server } => return Ok(server),
                ServerFrame::Error { message } => return Err(NetError::Rejected(message)),
                other => debug!(frame = ?other, "Ignoring frame before handshake"),
            },
            Message::Close(_) => return Err(NetError::Closed),
            _ => {}
        }
    }
    Err(NetError::Closed)
}

async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<(), NetError> {
    sink.send(Message::Text(frame.encode()?)).await?;
    Ok(())
}

async fn handle_server_frame(text: &str, notif_tx: &mpsc::Sender<TransportNotification>) {
    match ServerFrame::decode(text) {
        Ok(ServerFrame::Message { destination, body }) => {
            let Some(channel) = Channel::from_destination(&destination) else {
                warn!(destination = %destination, "Message on unknown destination");
                return;
            };
            let _ = notif_tx
                .send(TransportNotification::MessageReceived { channel, body })
                .await;
        }
        Ok(ServerFrame::Error { message }) => {
            warn!(message = %message, "Broker reported an error");
        }
        Ok(ServerFrame::Connected { .. }) => {
            debug!("Duplicate handshake acknowledgement");
        }
        Err(e) => {
            warn!(error = %e, "Malformed frame from broker");
        }
    }
}
