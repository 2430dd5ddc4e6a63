//! Carries out the media side of [`CallAction`]s.
//!
//! Each call gets a worker task that owns its audio capture and peer link.
//! The worker processes operations in order and reports completions as
//! [`CallEvent::Media`], so the controlling task never waits on media.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use causerie_shared::{IceCandidate, SessionDescription};

use crate::backend::{AudioCapture, LinkObserver, MediaBackend, MediaLink};
use crate::error::MediaError;
use crate::signaling::{CallAction, CallEvent, CallId, MediaEvent, MediaMode};

#[derive(Debug)]
enum MediaOp {
    ApplyAnswer(SessionDescription),
    AddCandidates(Vec<IceCandidate>),
    SetMuted(bool),
    Release,
}

pub struct MediaDriver {
    backend: Arc<dyn MediaBackend>,
    events: mpsc::Sender<CallEvent>,
    workers: HashMap<CallId, mpsc::UnboundedSender<MediaOp>>,
    ring_timers: HashMap<CallId, JoinHandle<()>>,
}

impl MediaDriver {
    pub fn new(backend: Arc<dyn MediaBackend>, events: mpsc::Sender<CallEvent>) -> Self {
        Self {
            backend,
            events,
            workers: HashMap::new(),
            ring_timers: HashMap::new(),
        }
    }

    /// Whether a worker is alive for `call`.
    pub fn has_media(&self, call: CallId) -> bool {
        self.workers.contains_key(&call)
    }

    /// Apply one action. Actions that are not about media or timers are
    /// ignored.
    pub fn apply(&mut self, action: CallAction) {
        match action {
            CallAction::StartMedia { call, mode } => self.start(call, mode),
            CallAction::ApplyRemoteAnswer { call, answer } => {
                self.dispatch(call, MediaOp::ApplyAnswer(answer))
            }
            CallAction::AddCandidates { call, candidates } => {
                self.dispatch(call, MediaOp::AddCandidates(candidates))
            }
            CallAction::SetMuted { call, muted } => self.dispatch(call, MediaOp::SetMuted(muted)),
            CallAction::ReleaseMedia { call } => self.release(call),
            CallAction::ArmRingTimer { call, after } => {
                let events = self.events.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = events.send(CallEvent::RingTimeout(call)).await;
                });
                if let Some(previous) = self.ring_timers.insert(call, handle) {
                    previous.abort();
                }
            }
            CallAction::CancelRingTimer { call } => {
                if let Some(timer) = self.ring_timers.remove(&call) {
                    timer.abort();
                }
            }
            CallAction::Send(_) | CallAction::Notify(_) => {}
        }
    }

    fn start(&mut self, call: CallId, mode: MediaMode) {
        if self.workers.contains_key(&call) {
            warn!(call = %call, "Media already started");
            return;
        }
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        self.workers.insert(call, op_tx);

        let backend = Arc::clone(&self.backend);
        let observer = LinkObserver::new(call, self.events.clone());
        tokio::spawn(run_worker(backend, mode, observer, op_rx));
    }

    fn dispatch(&self, call: CallId, op: MediaOp) {
        match self.workers.get(&call) {
            Some(tx) => {
                if tx.send(op).is_err() {
                    warn!(call = %call, "Media worker is gone");
                }
            }
            None => debug!(call = %call, op = ?op, "No media for call"),
        }
    }

    fn release(&mut self, call: CallId) {
        match self.workers.remove(&call) {
            Some(tx) => {
                let _ = tx.send(MediaOp::Release);
            }
            None => debug!(call = %call, "Media already released"),
        }
    }

    /// Release every call and cancel every timer.
    pub fn shutdown(&mut self) {
        for (_, tx) in self.workers.drain() {
            let _ = tx.send(MediaOp::Release);
        }
        for (_, timer) in self.ring_timers.drain() {
            timer.abort();
        }
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    backend: Arc<dyn MediaBackend>,
    mode: MediaMode,
    observer: LinkObserver,
    mut ops: mpsc::UnboundedReceiver<MediaOp>,
) {
    let call = observer.call();
    let mut capture: Option<Box<dyn AudioCapture>> = None;
    let mut link: Option<Box<dyn MediaLink>> = None;

    match negotiate(&*backend, mode, &observer, &mut capture, &mut link).await {
        Ok(event) => observer.report(event).await,
        Err(e) => {
            warn!(call = %call, error = %e, "Media setup failed");
            observer.report(MediaEvent::Failed(e.to_string())).await;
        }
    }

    while let Some(op) = ops.recv().await {
        match op {
            MediaOp::Release => break,
            MediaOp::ApplyAnswer(answer) => {
                let Some(link) = link.as_mut() else { continue };
                if let Err(e) = link.apply_answer(answer).await {
                    warn!(call = %call, error = %e, "Remote answer rejected");
                    observer.report(MediaEvent::Failed(e.to_string())).await;
                }
            }
            MediaOp::AddCandidates(candidates) => {
                let Some(link) = link.as_mut() else { continue };
                for candidate in candidates {
                    if let Err(e) = link.add_candidate(candidate).await {
                        warn!(call = %call, error = %e, "Remote ICE candidate rejected");
                    }
                }
            }
            MediaOp::SetMuted(muted) => {
                if let Some(capture) = capture.as_ref() {
                    capture.set_muted(muted);
                }
            }
        }
    }

    if let Some(mut link) = link.take() {
        link.close().await;
    }
    if let Some(mut capture) = capture.take() {
        capture.stop();
    }
    info!(call = %call, "Media released");
}

/// Acquire audio, open the link and produce our description. Whatever was
/// acquired is left in `capture`/`link` so the caller releases it even on
/// failure.
async fn negotiate(
    backend: &dyn MediaBackend,
    mode: MediaMode,
    observer: &LinkObserver,
    capture: &mut Option<Box<dyn AudioCapture>>,
    link: &mut Option<Box<dyn MediaLink>>,
) -> Result<MediaEvent, MediaError> {
    let input = backend.acquire_audio().await?;
    *capture = Some(input.capture);

    let link = link.insert(backend.open_link(input.frames, observer.clone()).await?);
    match mode {
        MediaMode::Offer => Ok(MediaEvent::OfferCreated(link.create_offer().await?)),
        MediaMode::Answer { remote_offer } => Ok(MediaEvent::AnswerCreated(
            link.accept_offer(remote_offer).await?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use causerie_shared::SdpKind;

    use super::*;
    use crate::backend::{AudioFrame, AudioInput};

    #[derive(Default)]
    struct Counters {
        acquired: AtomicUsize,
        stopped: AtomicUsize,
        closed: AtomicUsize,
        candidates: AtomicUsize,
        answers: AtomicUsize,
    }

    struct FakeBackend {
        counters: Arc<Counters>,
        deny_audio: bool,
    }

    struct FakeCapture(Arc<Counters>);

    impl AudioCapture for FakeCapture {
        fn set_muted(&self, _muted: bool) {}

        fn stop(&mut self) {
            self.0.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeLink(Arc<Counters>);

    #[async_trait]
    impl MediaLink for FakeLink {
        async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
            Ok(SessionDescription::offer("v=0 fake"))
        }

        async fn accept_offer(
            &mut self,
            _offer: SessionDescription,
        ) -> Result<SessionDescription, MediaError> {
            Ok(SessionDescription::answer("v=0 fake"))
        }

        async fn apply_answer(&mut self, _answer: SessionDescription) -> Result<(), MediaError> {
            self.0.answers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn add_candidate(&mut self, _candidate: IceCandidate) -> Result<(), MediaError> {
            self.0.candidates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {
            self.0.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MediaBackend for FakeBackend {
        async fn acquire_audio(&self) -> Result<AudioInput, MediaError> {
            if self.deny_audio {
                return Err(MediaError::PermissionDenied);
            }
            self.counters.acquired.fetch_add(1, Ordering::SeqCst);
            let (_tx, frames) = mpsc::channel::<AudioFrame>(1);
            Ok(AudioInput {
                frames,
                capture: Box::new(FakeCapture(Arc::clone(&self.counters))),
            })
        }

        async fn open_link(
            &self,
            _audio: mpsc::Receiver<AudioFrame>,
            _observer: LinkObserver,
        ) -> Result<Box<dyn MediaLink>, MediaError> {
            Ok(Box::new(FakeLink(Arc::clone(&self.counters))))
        }
    }

    fn driver(deny_audio: bool) -> (MediaDriver, Arc<Counters>, mpsc::Receiver<CallEvent>) {
        let counters = Arc::new(Counters::default());
        let backend = Arc::new(FakeBackend {
            counters: Arc::clone(&counters),
            deny_audio,
        });
        let (tx, rx) = mpsc::channel(16);
        (MediaDriver::new(backend, tx), counters, rx)
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_offer_is_reported() {
        let (mut driver, counters, mut events) = driver(false);
        driver.apply(CallAction::StartMedia {
            call: CallId(1),
            mode: MediaMode::Offer,
        });

        match events.recv().await {
            Some(CallEvent::Media {
                call,
                event: MediaEvent::OfferCreated(offer),
            }) => {
                assert_eq!(call, CallId(1));
                assert_eq!(offer.kind, SdpKind::Offer);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(counters.acquired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_happens_once() {
        let (mut driver, counters, mut events) = driver(false);
        let call = CallId(1);
        driver.apply(CallAction::StartMedia {
            call,
            mode: MediaMode::Offer,
        });
        events.recv().await;

        driver.apply(CallAction::ApplyRemoteAnswer {
            call,
            answer: SessionDescription::answer("v=0 peer"),
        });
        driver.apply(CallAction::ReleaseMedia { call });
        driver.apply(CallAction::ReleaseMedia { call });
        assert!(!driver.has_media(call));

        wait_until(|| counters.closed.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counters.answers.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquisition_failure_is_reported() {
        let (mut driver, counters, mut events) = driver(true);
        let call = CallId(3);
        driver.apply(CallAction::StartMedia {
            call,
            mode: MediaMode::Offer,
        });

        match events.recv().await {
            Some(CallEvent::Media {
                event: MediaEvent::Failed(reason),
                ..
            }) => assert_eq!(reason, "Microphone access was denied"),
            other => panic!("unexpected {other:?}"),
        }

        driver.apply(CallAction::ReleaseMedia { call });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_candidates_follow_answer_in_order() {
        let (mut driver, counters, mut events) = driver(false);
        let call = CallId(2);
        driver.apply(CallAction::StartMedia {
            call,
            mode: MediaMode::Answer {
                remote_offer: SessionDescription::offer("v=0 peer"),
            },
        });
        driver.apply(CallAction::AddCandidates {
            call,
            candidates: vec![
                IceCandidate {
                    candidate: "candidate:1".into(),
                    sdp_mid: None,
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                };
                2
            ],
        });

        assert!(matches!(
            events.recv().await,
            Some(CallEvent::Media {
                event: MediaEvent::AnswerCreated(_),
                ..
            })
        ));
        wait_until(|| counters.candidates.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timer_fires_and_cancels() {
        let (mut driver, _counters, mut events) = driver(false);
        driver.apply(CallAction::ArmRingTimer {
            call: CallId(5),
            after: Duration::from_secs(30),
        });
        assert!(matches!(
            events.recv().await,
            Some(CallEvent::RingTimeout(CallId(5)))
        ));

        driver.apply(CallAction::ArmRingTimer {
            call: CallId(6),
            after: Duration::from_secs(30),
        });
        driver.apply(CallAction::CancelRingTimer { call: CallId(6) });
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(events.try_recv().is_err());
    }
}
