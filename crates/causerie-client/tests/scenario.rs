//! End-to-end scenarios: an in-process broker with several clients talking
//! to it over real WebSockets. Media is faked so calls need no audio device
//! or ICE connectivity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use causerie_client::{CallCommand, Client, ClientCommand, ClientConfig, ClientError, ClientEvent};
use causerie_media::{
    AudioCapture, AudioFrame, AudioInput, LinkObserver, MediaBackend, MediaError, MediaLink,
};
use causerie_net::WsConnector;
use causerie_server::ServerConfig;
use causerie_shared::constants::WS_PATH;
use causerie_shared::{IceCandidate, SessionDescription, UserId};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Fake media
// ---------------------------------------------------------------------------

struct FakeBackend;

struct FakeCapture;

impl AudioCapture for FakeCapture {
    fn set_muted(&self, _muted: bool) {}
    fn stop(&mut self) {}
}

struct FakeLink;

#[async_trait]
impl MediaLink for FakeLink {
    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::offer("v=0\r\ns=fake-offer\r\n"))
    }

    async fn accept_offer(
        &mut self,
        _offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::answer("v=0\r\ns=fake-answer\r\n"))
    }

    async fn apply_answer(&mut self, _answer: SessionDescription) -> Result<(), MediaError> {
        Ok(())
    }

    async fn add_candidate(&mut self, _candidate: IceCandidate) -> Result<(), MediaError> {
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl MediaBackend for FakeBackend {
    async fn acquire_audio(&self) -> Result<AudioInput, MediaError> {
        let (_tx, frames) = mpsc::channel::<AudioFrame>(1);
        Ok(AudioInput {
            frames,
            capture: Box::new(FakeCapture),
        })
    }

    async fn open_link(
        &self,
        _audio: mpsc::Receiver<AudioFrame>,
        observer: LinkObserver,
    ) -> Result<Box<dyn MediaLink>, MediaError> {
        // Gathered before any description exists, so it has to be held back
        observer
            .local_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })
            .await;
        Ok(Box::new(FakeLink))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct TestClient {
    commands: mpsc::Sender<ClientCommand>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    task: JoinHandle<Result<(), ClientError>>,
}

impl TestClient {
    async fn send(&self, cmd: ClientCommand) {
        self.commands.send(cmd).await.unwrap();
    }

    async fn call(&self, cmd: CallCommand) {
        self.send(ClientCommand::Call(cmd)).await;
    }

    /// Skip events until one matches.
    async fn expect(&mut self, what: &str, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        let events = &mut self.events;
        let found = timeout(EVENT_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(event)) => event,
            Ok(None) => panic!("event stream closed while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }

    /// Collect events up to and including the first one that matches.
    async fn collect_until(
        &mut self,
        what: &str,
        pred: impl Fn(&ClientEvent) -> bool,
    ) -> Vec<ClientEvent> {
        let mut seen = Vec::new();
        let events = &mut self.events;
        let done = timeout(EVENT_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                let stop = pred(&event);
                seen.push(event);
                if stop {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(done, Ok(true)), "never saw {what}");
        seen
    }

    async fn expect_peers(&mut self, expected: &[&str]) {
        let expected: Vec<UserId> = expected.iter().map(|n| UserId::from(*n)).collect();
        self.expect(&format!("presence {expected:?}"), |e| {
            matches!(e, ClientEvent::PresenceChanged(p) if p.users == expected)
        })
        .await;
    }

    async fn expect_call_state(&mut self, state: &str) -> ClientEvent {
        self.expect(&format!("call state {state}"), |e| {
            matches!(e, ClientEvent::CallStateChanged(c) if c.state == state)
        })
        .await
    }
}

async fn start_broker() -> String {
    let config = ServerConfig {
        http_addr: ([127, 0, 0, 1], 0).into(),
        instance_name: "scenario".into(),
        ..ServerConfig::default()
    };
    let (addr, _server) = causerie_server::spawn(config).await.unwrap();
    format!("ws://{addr}{WS_PATH}")
}

fn start_client(url: &str, name: &str) -> TestClient {
    let config = ClientConfig {
        server_url: url.to_string(),
        reconnect_delay: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    let (client, handle) = Client::new(
        &config,
        UserId::from(name),
        None,
        Box::new(WsConnector::new(url)),
        Arc::new(FakeBackend),
    );
    TestClient {
        commands: handle.commands,
        events: handle.events,
        task: tokio::spawn(client.run()),
    }
}

fn is_message(event: &ClientEvent, sender: &str, content: &str, outgoing: bool) -> bool {
    matches!(
        event,
        ClientEvent::NewMessage(m)
            if m.sender.as_str() == sender && m.content == content && m.outgoing == outgoing
    )
}

fn is_notice(event: &ClientEvent, text: &str) -> bool {
    matches!(event, ClientEvent::SystemNotice(n) if n.text == text)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_chat_and_presence() {
    let url = start_broker().await;

    let mut alice = start_client(&url, "alice");
    alice.expect_peers(&[]).await;

    let mut bob = start_client(&url, "bob");
    alice
        .expect("bob's join notice", |e| is_notice(e, "bob joined the chat"))
        .await;
    alice.expect_peers(&["bob"]).await;
    bob.expect_peers(&["alice"]).await;

    // Public message: echoed locally once, delivered to bob
    alice
        .send(ClientCommand::SendMessage {
            content: "hello everyone".into(),
            to: None,
        })
        .await;
    bob.expect("public message", |e| is_message(e, "alice", "hello everyone", false))
        .await;

    // Private message
    alice
        .send(ClientCommand::SendMessage {
            content: "just you".into(),
            to: Some(UserId::from("bob")),
        })
        .await;
    let received = bob
        .expect("private message", |e| is_message(e, "alice", "just you", false))
        .await;
    match received {
        ClientEvent::NewMessage(m) => assert_eq!(m.receiver, Some(UserId::from("bob"))),
        other => panic!("unexpected event {other:?}"),
    }

    // Alice saw her own messages only as local echoes
    let seen = alice
        .collect_until("private echo", |e| is_message(e, "alice", "just you", true))
        .await;
    assert!(seen
        .iter()
        .any(|e| is_message(e, "alice", "hello everyone", true)));
    assert!(!seen.iter().any(|e| matches!(
        e,
        ClientEvent::NewMessage(m) if m.sender.as_str() == "alice" && !m.outgoing
    )));

    // Sending to yourself is refused locally
    bob.send(ClientCommand::SendMessage {
        content: "me".into(),
        to: Some(UserId::from("bob")),
    })
    .await;
    bob.expect("self-addressed error", |e| matches!(e, ClientEvent::Error(_)))
        .await;

    bob.send(ClientCommand::Leave).await;
    alice.expect("bob's leave notice", |e| is_notice(e, "bob left the chat"))
        .await;
    alice.expect_peers(&[]).await;
    timeout(EVENT_TIMEOUT, bob.task)
        .await
        .expect("bob stops after leaving")
        .unwrap()
        .unwrap();

    alice.send(ClientCommand::Leave).await;
    timeout(EVENT_TIMEOUT, alice.task)
        .await
        .expect("alice stops after leaving")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_call_lifecycle_with_busy_callee() {
    let url = start_broker().await;

    let mut alice = start_client(&url, "alice");
    alice.expect_peers(&[]).await;
    let mut bob = start_client(&url, "bob");
    bob.expect_peers(&["alice"]).await;
    let mut carol = start_client(&url, "carol");
    carol.expect_peers(&["alice", "bob"]).await;
    alice.expect_peers(&["bob", "carol"]).await;
    bob.expect_peers(&["alice", "carol"]).await;

    // Alice calls bob, bob answers
    alice.call(CallCommand::Start(UserId::from("bob"))).await;
    alice.expect_call_state("calling").await;
    let ringing = bob.expect_call_state("ringing").await;
    match ringing {
        ClientEvent::CallStateChanged(c) => assert_eq!(c.peer, Some(UserId::from("alice"))),
        other => panic!("unexpected event {other:?}"),
    }
    bob.call(CallCommand::Accept).await;
    bob.expect_call_state("connected").await;
    alice.expect_call_state("connected").await;

    // Carol gets turned away while bob is on the line
    carol.call(CallCommand::Start(UserId::from("bob"))).await;
    let turned_away = carol.expect_call_state("ended").await;
    match turned_away {
        ClientEvent::CallStateChanged(c) => assert_eq!(c.message, "User is busy"),
        other => panic!("unexpected event {other:?}"),
    }
    bob.expect_call_state("busy").await;

    // Alice hangs up; both sides end
    alice.call(CallCommand::Hangup).await;
    let ended = alice.expect_call_state("ended").await;
    match ended {
        ClientEvent::CallStateChanged(c) => assert_eq!(c.message, "Call ended"),
        other => panic!("unexpected event {other:?}"),
    }
    let ended = bob.expect_call_state("ended").await;
    match ended {
        ClientEvent::CallStateChanged(c) => {
            assert_eq!(c.message, "Call ended by the other side")
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Hanging up again is a no-op; bob is free for a new call
    alice.call(CallCommand::Hangup).await;
    carol.call(CallCommand::Start(UserId::from("bob"))).await;
    bob.expect_call_state("ringing").await;
    bob.call(CallCommand::Reject).await;
    let declined = carol.expect_call_state("ended").await;
    match declined {
        ClientEvent::CallStateChanged(c) => assert_eq!(c.message, "Call was declined"),
        other => panic!("unexpected event {other:?}"),
    }

    for client in [alice, bob, carol] {
        client.send(ClientCommand::Leave).await;
        timeout(EVENT_TIMEOUT, client.task)
            .await
            .expect("client stops after leaving")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_call_to_offline_user_is_refused() {
    let url = start_broker().await;
    let mut alice = start_client(&url, "alice");
    alice.expect_peers(&[]).await;

    alice.call(CallCommand::Start(UserId::from("ghost"))).await;
    alice
        .expect("offline error", |e| matches!(e, ClientEvent::Error(_)))
        .await;

    alice.send(ClientCommand::Leave).await;
    timeout(EVENT_TIMEOUT, alice.task)
        .await
        .expect("alice stops after leaving")
        .unwrap()
        .unwrap();
}
