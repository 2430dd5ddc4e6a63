//! WebRTC media backend: one PCMU audio track each way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use causerie_shared::constants::DEFAULT_STUN_SERVERS;
use causerie_shared::{IceCandidate, SdpKind, SessionDescription};

use crate::audio::{self, AudioConfig};
use crate::backend::{AudioFrame, AudioInput, LinkObserver, MediaBackend, MediaLink};
use crate::codec::{self, PCMU_SAMPLE_RATE};
use crate::error::MediaError;

pub struct WebRtcBackend {
    ice_servers: Vec<String>,
    audio: AudioConfig,
}

impl WebRtcBackend {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            audio: AudioConfig::default(),
        }
    }
}

impl Default for WebRtcBackend {
    fn default() -> Self {
        Self::new(DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect())
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn acquire_audio(&self) -> Result<AudioInput, MediaError> {
        audio::open_capture(&self.audio).await
    }

    async fn open_link(
        &self,
        audio: mpsc::Receiver<AudioFrame>,
        observer: LinkObserver,
    ) -> Result<Box<dyn MediaLink>, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PCMU_SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "causerie".to_owned(),
        ));
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // RTCP has to be read for the interceptors to run
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        let pump = tokio::spawn(pump_audio(track, audio));

        let candidate_observer = observer.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let observer = candidate_observer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        observer
                            .local_candidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            })
                            .await
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize ICE candidate"),
                }
            })
        }));

        let state_observer = observer.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let observer = state_observer.clone();
            Box::pin(async move {
                match state {
                    RTCIceConnectionState::Connected => {
                        info!(call = %observer.call(), "Media link up");
                    }
                    RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => {
                        observer.link_lost(format!("ICE {state}")).await;
                    }
                    other => debug!(call = %observer.call(), state = %other, "ICE state"),
                }
            })
        }));

        let playback = self.audio.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                tokio::spawn(play_remote(track, playback.clone()));
                Box::pin(async {})
            },
        ));

        info!(call = %observer.call(), "Peer link opened");
        Ok(Box::new(WebRtcLink {
            pc,
            pump,
            closed: false,
        }))
    }
}

async fn pump_audio(track: Arc<TrackLocalStaticSample>, mut frames: mpsc::Receiver<AudioFrame>) {
    while let Some(frame) = frames.recv().await {
        let payload = codec::encode_frame(&frame);
        let duration =
            Duration::from_micros(payload.len() as u64 * 1_000_000 / u64::from(PCMU_SAMPLE_RATE));
        let sample = Sample {
            data: Bytes::from(payload),
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!(error = %e, "Dropped outgoing audio sample");
        }
    }
}

async fn play_remote(track: Arc<TrackRemote>, config: AudioConfig) {
    let (frame_tx, frame_rx) = mpsc::channel(64);
    let _output = match audio::open_playback(&config, frame_rx).await {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "Cannot play remote audio");
            return;
        }
    };
    info!("Remote audio track started");

    while let Ok((packet, _)) = track.read_rtp().await {
        if frame_tx
            .send(codec::decode_payload(&packet.payload))
            .await
            .is_err()
        {
            break;
        }
    }
    debug!("Remote audio track ended");
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    pump: JoinHandle<()>,
    closed: bool,
}

fn expect_kind(desc: &SessionDescription, kind: SdpKind) -> Result<(), MediaError> {
    if desc.kind == kind {
        Ok(())
    } else {
        Err(MediaError::Negotiation(format!(
            "expected {kind:?} description, got {:?}",
            desc.kind
        )))
    }
}

#[async_trait]
impl MediaLink for WebRtcLink {
    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        expect_kind(&offer, SdpKind::Offer)?;
        self.pc
            .set_remote_description(RTCSessionDescription::offer(offer.sdp)?)
            .await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), MediaError> {
        expect_kind(&answer, SdpKind::Answer)?;
        self.pc
            .set_remote_description(RTCSessionDescription::answer(answer.sdp)?)
            .await?;
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pump.abort();
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Error closing peer connection");
        }
        debug!("Peer link closed");
    }
}
