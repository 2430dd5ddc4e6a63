//! Seams between the call driver and the platform media stack.

use async_trait::async_trait;
use tokio::sync::mpsc;

use causerie_shared::{IceCandidate, SessionDescription};

use crate::error::MediaError;
use crate::signaling::{CallEvent, CallId, MediaEvent};

/// One frame of mono PCM at [`AUDIO_SAMPLE_RATE`](crate::audio::AUDIO_SAMPLE_RATE).
pub type AudioFrame = Vec<f32>;

/// A running microphone capture.
pub trait AudioCapture: Send {
    fn set_muted(&self, muted: bool);

    /// Stop capturing and release the device. Safe to call more than once.
    fn stop(&mut self);
}

/// Captured audio plus the handle that controls it.
pub struct AudioInput {
    pub frames: mpsc::Receiver<AudioFrame>,
    pub capture: Box<dyn AudioCapture>,
}

/// A negotiated (or negotiating) peer media link.
#[async_trait]
pub trait MediaLink: Send {
    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError>;

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), MediaError>;

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Tear the link down. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Acquire the microphone.
    async fn acquire_audio(&self) -> Result<AudioInput, MediaError>;

    /// Open a link that sends `audio` to the peer and plays back what the
    /// peer sends. Link activity is reported through `observer`.
    async fn open_link(
        &self,
        audio: mpsc::Receiver<AudioFrame>,
        observer: LinkObserver,
    ) -> Result<Box<dyn MediaLink>, MediaError>;
}

/// Reports link activity for one call back to the controller.
#[derive(Clone)]
pub struct LinkObserver {
    call: CallId,
    events: mpsc::Sender<CallEvent>,
}

impl LinkObserver {
    pub fn new(call: CallId, events: mpsc::Sender<CallEvent>) -> Self {
        Self { call, events }
    }

    pub fn call(&self) -> CallId {
        self.call
    }

    pub async fn local_candidate(&self, candidate: IceCandidate) {
        self.report(MediaEvent::LocalCandidate(candidate)).await;
    }

    pub async fn link_lost(&self, reason: impl Into<String>) {
        self.report(MediaEvent::LinkLost(reason.into())).await;
    }

    pub(crate) async fn report(&self, event: MediaEvent) {
        let _ = self
            .events
            .send(CallEvent::Media {
                call: self.call,
                event,
            })
            .await;
    }
}
