//! Call signaling state machine.
//!
//! The engine owns at most one [`CallSession`]. It consumes [`CallEvent`]s
//! and answers with [`CallAction`]s for the caller to carry out; it never
//! touches the network or the media stack itself.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use causerie_shared::constants::RING_TIMEOUT_SECS;
use causerie_shared::{
    CallMessage, CallSignal, IceCandidate, RejectReason, SessionDescription, UserId,
};

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallState {
    Idle,
    Calling,
    Ringing,
    Connected,
    /// Reported once when a call finishes; the engine is `Idle` again.
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub id: CallId,
    pub peer: UserId,
    pub role: CallRole,
    pub state: CallState,
    pub local_offer: Option<SessionDescription>,
    pub local_answer: Option<SessionDescription>,
    pub remote_offer: Option<SessionDescription>,
    pub remote_answer: Option<SessionDescription>,
    pub pending_remote_candidates: VecDeque<IceCandidate>,
    pub started_at: Option<DateTime<Utc>>,
    pub muted: bool,
    /// Our candidates, held until the offer or answer is on the wire.
    pending_local_candidates: Vec<IceCandidate>,
    media_started: bool,
    remote_applied: bool,
    ring_timer_armed: bool,
    peer_present: bool,
}

impl CallSession {
    fn new(id: CallId, peer: UserId, role: CallRole, state: CallState) -> Self {
        Self {
            id,
            peer,
            role,
            state,
            local_offer: None,
            local_answer: None,
            remote_offer: None,
            remote_answer: None,
            pending_remote_candidates: VecDeque::new(),
            started_at: None,
            muted: false,
            pending_local_candidates: Vec::new(),
            media_started: false,
            remote_applied: false,
            ring_timer_armed: false,
            peer_present: true,
        }
    }

    /// Time since the call connected.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.started_at.map(|t| Utc::now() - t)
    }

    fn description_sent(&self) -> bool {
        self.local_offer.is_some() || self.local_answer.is_some()
    }

    /// Last message owed to the peer when we end the call ourselves.
    fn farewell(&self) -> Option<CallSignal> {
        match self.role {
            CallRole::Callee if self.local_answer.is_none() => {
                self.peer_present.then_some(CallSignal::CallReject {
                    reason: RejectReason::Rejected,
                })
            }
            _ if self.description_sent() && self.peer_present => Some(CallSignal::CallEnd),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum CallEvent {
    Initiate(UserId),
    Accept,
    Reject,
    Hangup,
    SetMuted(bool),
    /// Call-control message from the broker.
    Signal(CallMessage),
    /// Completion reported by the media worker of `call`.
    Media { call: CallId, event: MediaEvent },
    RingTimeout(CallId),
}

#[derive(Debug, Clone)]
pub enum MediaEvent {
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    LocalCandidate(IceCandidate),
    /// Capture or negotiation failed. Carries a user-facing reason.
    Failed(String),
    /// An established link dropped.
    LinkLost(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaMode {
    Offer,
    Answer { remote_offer: SessionDescription },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    Send(CallMessage),
    /// Acquire audio, open the link and produce an offer or answer.
    StartMedia { call: CallId, mode: MediaMode },
    ApplyRemoteAnswer {
        call: CallId,
        answer: SessionDescription,
    },
    AddCandidates {
        call: CallId,
        candidates: Vec<IceCandidate>,
    },
    SetMuted { call: CallId, muted: bool },
    /// Close the link and stop the capture. Emitted at most once per call.
    ReleaseMedia { call: CallId },
    ArmRingTimer { call: CallId, after: Duration },
    CancelRingTimer { call: CallId },
    Notify(CallNotice),
}

/// What the user should be told.
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    Outgoing {
        peer: UserId,
    },
    Incoming {
        peer: UserId,
    },
    Connected {
        peer: UserId,
        started_at: DateTime<Utc>,
    },
    MuteChanged {
        muted: bool,
    },
    /// Somebody called while we were busy and was turned away.
    BusyRejected {
        caller: UserId,
    },
    Ended {
        peer: UserId,
        reason: EndReason,
        duration: Option<chrono::Duration>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    HungUp,
    Declined,
    NoAnswer,
    PeerDeclined,
    PeerBusy,
    PeerHungUp,
    LinkLost(String),
    MediaFailed(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::HungUp => f.write_str("Call ended"),
            EndReason::Declined => f.write_str("Call declined"),
            EndReason::NoAnswer => f.write_str("Call not answered"),
            EndReason::PeerDeclined => f.write_str("Call was declined"),
            EndReason::PeerBusy => f.write_str("User is busy"),
            EndReason::PeerHungUp => f.write_str("Call ended by the other side"),
            EndReason::LinkLost(detail) => write!(f, "Connection lost: {detail}"),
            EndReason::MediaFailed(detail) => write!(f, "Call setup failed. {detail}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct CallEngine {
    local_user: UserId,
    ring_timeout: Duration,
    next_id: u64,
    session: Option<CallSession>,
}

impl CallEngine {
    pub fn new(local_user: UserId) -> Self {
        Self::with_ring_timeout(local_user, Duration::from_secs(RING_TIMEOUT_SECS))
    }

    pub fn with_ring_timeout(local_user: UserId, ring_timeout: Duration) -> Self {
        Self {
            local_user,
            ring_timeout,
            next_id: 1,
            session: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn handle(&mut self, event: CallEvent) -> Result<Vec<CallAction>, CallError> {
        match event {
            CallEvent::Initiate(peer) => self.initiate(peer),
            CallEvent::Accept => self.accept(),
            CallEvent::Reject => self.reject(),
            CallEvent::Hangup => Ok(self.hangup()),
            CallEvent::SetMuted(muted) => self.set_muted(muted),
            CallEvent::Signal(msg) => Ok(self.on_signal(msg)),
            CallEvent::Media { call, event } => Ok(self.on_media(call, event)),
            CallEvent::RingTimeout(call) => Ok(self.on_ring_timeout(call)),
        }
    }

    pub fn initiate(&mut self, peer: UserId) -> Result<Vec<CallAction>, CallError> {
        if peer == self.local_user {
            return Err(CallError::SelfCall);
        }
        if let Some(existing) = &self.session {
            return Err(CallError::AlreadyInCall(existing.peer.clone()));
        }

        let id = self.allocate_id();
        let mut session = CallSession::new(id, peer.clone(), CallRole::Caller, CallState::Calling);
        session.media_started = true;
        self.session = Some(session);
        info!(call = %id, peer = %peer, "Calling");

        Ok(vec![
            CallAction::StartMedia {
                call: id,
                mode: MediaMode::Offer,
            },
            CallAction::Notify(CallNotice::Outgoing { peer }),
        ])
    }

    pub fn accept(&mut self) -> Result<Vec<CallAction>, CallError> {
        let session = self
            .session
            .as_mut()
            .filter(|s| s.state == CallState::Ringing)
            .ok_or(CallError::NoIncomingCall)?;
        let remote_offer = session
            .remote_offer
            .clone()
            .ok_or(CallError::NoIncomingCall)?;

        let started_at = Utc::now();
        session.state = CallState::Connected;
        session.started_at = Some(started_at);
        session.media_started = true;
        session.remote_applied = true;
        session.ring_timer_armed = false;
        info!(call = %session.id, peer = %session.peer, "Accepted call");

        let mut actions = vec![
            CallAction::CancelRingTimer { call: session.id },
            CallAction::StartMedia {
                call: session.id,
                mode: MediaMode::Answer { remote_offer },
            },
        ];
        flush_remote_candidates(session, &mut actions);
        actions.push(CallAction::Notify(CallNotice::Connected {
            peer: session.peer.clone(),
            started_at,
        }));
        Ok(actions)
    }

    pub fn reject(&mut self) -> Result<Vec<CallAction>, CallError> {
        if self.state() != CallState::Ringing {
            return Err(CallError::NoIncomingCall);
        }
        Ok(self.end_call(EndReason::Declined, true))
    }

    /// End the current call from our side. A no-op without a call.
    pub fn hangup(&mut self) -> Vec<CallAction> {
        match self.state() {
            CallState::Idle | CallState::Ended => {
                debug!("Hangup without an active call");
                Vec::new()
            }
            CallState::Ringing => self.end_call(EndReason::Declined, true),
            CallState::Calling | CallState::Connected => self.end_call(EndReason::HungUp, true),
        }
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<Vec<CallAction>, CallError> {
        let session = self
            .session
            .as_mut()
            .filter(|s| s.media_started)
            .ok_or(CallError::NoActiveCall)?;
        if session.muted == muted {
            return Ok(Vec::new());
        }
        session.muted = muted;
        debug!(call = %session.id, muted, "Mute changed");
        Ok(vec![
            CallAction::SetMuted {
                call: session.id,
                muted,
            },
            CallAction::Notify(CallNotice::MuteChanged { muted }),
        ])
    }

    /// Track whether the peer is still in the chat. A departed peer is not
    /// sent `CALL_END`.
    pub fn observe_presence(&mut self, members: &BTreeSet<UserId>) {
        if let Some(session) = self.session.as_mut() {
            let present = members.contains(&session.peer);
            if session.peer_present != present {
                debug!(peer = %session.peer, present, "Peer presence changed");
                session.peer_present = present;
            }
        }
    }

    pub fn on_signal(&mut self, msg: CallMessage) -> Vec<CallAction> {
        if msg.receiver != self.local_user {
            warn!(
                receiver = %msg.receiver,
                signal = msg.signal.name(),
                "Call message addressed to someone else"
            );
            return Vec::new();
        }
        if msg.sender == self.local_user {
            debug!(signal = msg.signal.name(), "Ignoring own call message");
            return Vec::new();
        }

        let CallMessage { signal, sender, .. } = msg;
        match signal {
            CallSignal::CallOffer { offer } => self.on_offer(sender, offer),
            CallSignal::CallAnswer { answer } => self.on_answer(sender, answer),
            CallSignal::IceCandidate { candidate } => self.on_remote_candidate(sender, candidate),
            CallSignal::CallReject { reason } => {
                let reason = match reason {
                    RejectReason::Busy => EndReason::PeerBusy,
                    RejectReason::Rejected => EndReason::PeerDeclined,
                };
                self.on_peer_ended(&sender, reason)
            }
            CallSignal::CallEnd => self.on_peer_ended(&sender, EndReason::PeerHungUp),
        }
    }

    pub fn on_media(&mut self, call: CallId, event: MediaEvent) -> Vec<CallAction> {
        let local = &self.local_user;
        let Some(session) = self.session.as_mut().filter(|s| s.id == call) else {
            debug!(call = %call, "Media event for a finished call");
            return Vec::new();
        };

        match event {
            MediaEvent::OfferCreated(offer) => {
                if session.role != CallRole::Caller || session.local_offer.is_some() {
                    warn!(call = %call, "Unexpected local offer");
                    return Vec::new();
                }
                session.local_offer = Some(offer.clone());
                debug!(call = %call, "Sending offer");
                let mut actions = vec![outgoing(local, &session.peer, CallSignal::CallOffer { offer })];
                flush_local_candidates(local, session, &mut actions);
                actions
            }
            MediaEvent::AnswerCreated(answer) => {
                if session.role != CallRole::Callee || session.local_answer.is_some() {
                    warn!(call = %call, "Unexpected local answer");
                    return Vec::new();
                }
                session.local_answer = Some(answer.clone());
                debug!(call = %call, "Sending answer");
                let mut actions =
                    vec![outgoing(local, &session.peer, CallSignal::CallAnswer { answer })];
                flush_local_candidates(local, session, &mut actions);
                actions
            }
            MediaEvent::LocalCandidate(candidate) => {
                if session.description_sent() {
                    vec![outgoing(
                        local,
                        &session.peer,
                        CallSignal::IceCandidate { candidate },
                    )]
                } else {
                    session.pending_local_candidates.push(candidate);
                    Vec::new()
                }
            }
            MediaEvent::Failed(reason) => {
                warn!(call = %call, reason = %reason, "Media failed");
                self.end_call(EndReason::MediaFailed(reason), true)
            }
            MediaEvent::LinkLost(reason) => {
                warn!(call = %call, reason = %reason, "Media link lost");
                self.end_call(EndReason::LinkLost(reason), true)
            }
        }
    }

    pub fn on_ring_timeout(&mut self, call: CallId) -> Vec<CallAction> {
        match &self.session {
            Some(s) if s.id == call && s.state == CallState::Ringing => {
                info!(call = %call, peer = %s.peer, "Incoming call not answered");
                self.end_call(EndReason::NoAnswer, true)
            }
            _ => {
                debug!(call = %call, "Stale ring timeout");
                Vec::new()
            }
        }
    }

    fn on_offer(&mut self, caller: UserId, offer: SessionDescription) -> Vec<CallAction> {
        if let Some(existing) = &self.session {
            info!(
                caller = %caller,
                current = %existing.peer,
                "Busy, turning away incoming call"
            );
            return vec![
                outgoing(
                    &self.local_user,
                    &caller,
                    CallSignal::CallReject {
                        reason: RejectReason::Busy,
                    },
                ),
                CallAction::Notify(CallNotice::BusyRejected { caller }),
            ];
        }

        let id = self.allocate_id();
        let mut session = CallSession::new(id, caller.clone(), CallRole::Callee, CallState::Ringing);
        session.remote_offer = Some(offer);
        session.ring_timer_armed = true;
        self.session = Some(session);
        info!(call = %id, caller = %caller, "Incoming call");

        vec![
            CallAction::ArmRingTimer {
                call: id,
                after: self.ring_timeout,
            },
            CallAction::Notify(CallNotice::Incoming { peer: caller }),
        ]
    }

    fn on_answer(&mut self, sender: UserId, answer: SessionDescription) -> Vec<CallAction> {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.peer == sender && s.state == CallState::Calling)
        else {
            warn!(sender = %sender, "Unexpected CALL_ANSWER");
            return Vec::new();
        };

        let started_at = Utc::now();
        session.remote_answer = Some(answer.clone());
        session.state = CallState::Connected;
        session.started_at = Some(started_at);
        session.remote_applied = true;
        info!(call = %session.id, peer = %sender, "Call connected");

        let mut actions = vec![CallAction::ApplyRemoteAnswer {
            call: session.id,
            answer,
        }];
        flush_remote_candidates(session, &mut actions);
        actions.push(CallAction::Notify(CallNotice::Connected {
            peer: sender,
            started_at,
        }));
        actions
    }

    fn on_remote_candidate(&mut self, sender: UserId, candidate: IceCandidate) -> Vec<CallAction> {
        let Some(session) = self.session.as_mut().filter(|s| s.peer == sender) else {
            debug!(sender = %sender, "ICE candidate outside of a call");
            return Vec::new();
        };
        if session.remote_applied {
            vec![CallAction::AddCandidates {
                call: session.id,
                candidates: vec![candidate],
            }]
        } else {
            session.pending_remote_candidates.push_back(candidate);
            debug!(
                call = %session.id,
                queued = session.pending_remote_candidates.len(),
                "Queued remote ICE candidate"
            );
            Vec::new()
        }
    }

    fn on_peer_ended(&mut self, sender: &UserId, reason: EndReason) -> Vec<CallAction> {
        match &self.session {
            Some(s) if s.peer == *sender => self.end_call(reason, false),
            _ => {
                debug!(sender = %sender, reason = %reason, "Ignoring end of unknown call");
                Vec::new()
            }
        }
    }

    /// Single teardown path. Taking the session makes a second call a no-op.
    fn end_call(&mut self, reason: EndReason, notify_peer: bool) -> Vec<CallAction> {
        let Some(session) = self.session.take() else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        if notify_peer {
            if let Some(signal) = session.farewell() {
                actions.push(outgoing(&self.local_user, &session.peer, signal));
            }
        }
        if session.ring_timer_armed {
            actions.push(CallAction::CancelRingTimer { call: session.id });
        }
        if session.media_started {
            actions.push(CallAction::ReleaseMedia { call: session.id });
        }

        let duration = session.elapsed();
        info!(call = %session.id, peer = %session.peer, reason = %reason, "Call ended");
        actions.push(CallAction::Notify(CallNotice::Ended {
            peer: session.peer,
            reason,
            duration,
        }));
        actions
    }

    fn allocate_id(&mut self) -> CallId {
        let id = CallId(self.next_id);
        self.next_id += 1;
        id
    }
}

fn outgoing(local: &UserId, peer: &UserId, signal: CallSignal) -> CallAction {
    CallAction::Send(CallMessage::new(local.clone(), peer.clone(), signal))
}

fn flush_remote_candidates(session: &mut CallSession, actions: &mut Vec<CallAction>) {
    if !session.pending_remote_candidates.is_empty() {
        actions.push(CallAction::AddCandidates {
            call: session.id,
            candidates: session.pending_remote_candidates.drain(..).collect(),
        });
    }
}

fn flush_local_candidates(local: &UserId, session: &mut CallSession, actions: &mut Vec<CallAction>) {
    for candidate in std::mem::take(&mut session.pending_local_candidates) {
        actions.push(outgoing(
            local,
            &session.peer,
            CallSignal::IceCandidate { candidate },
        ));
    }
}
