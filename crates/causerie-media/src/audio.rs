use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::{AudioCapture, AudioFrame, AudioInput};
use crate::error::MediaError;

/// Rate at which audio is captured and played back.
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

const FRAME_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: AUDIO_SAMPLE_RATE,
            channels: 1,
            frame_size_ms: 20,
        }
    }
}

impl AudioConfig {
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }

    fn frame_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_size_ms))
    }
}

/// Open the microphone.
pub async fn open_capture(config: &AudioConfig) -> Result<AudioInput, MediaError> {
    #[cfg(feature = "audio-device")]
    {
        device::start_capture(config).await
    }
    #[cfg(not(feature = "audio-device"))]
    {
        Ok(SilentCapture::start(config))
    }
}

/// Play `frames` on the default output until the channel closes or the
/// returned handle is dropped.
pub async fn open_playback(
    config: &AudioConfig,
    frames: mpsc::Receiver<AudioFrame>,
) -> Result<AudioOutput, MediaError> {
    #[cfg(feature = "audio-device")]
    {
        device::start_playback(config, frames).await
    }
    #[cfg(not(feature = "audio-device"))]
    {
        let _ = config;
        Ok(AudioOutput::discard(frames))
    }
}

/// Keeps playback running while held.
pub struct AudioOutput {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
}

impl AudioOutput {
    #[cfg(not(feature = "audio-device"))]
    fn discard(mut frames: mpsc::Receiver<AudioFrame>) -> Self {
        tokio::spawn(async move {
            let mut received = 0usize;
            while frames.recv().await.is_some() {
                received += 1;
            }
            debug!(frames = received, "Remote audio discarded");
        });
        Self { stop_tx: None }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Capture source that produces silence at the frame rate. Used when no
/// sound device support is built in.
pub struct SilentCapture {
    active: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
}

impl SilentCapture {
    pub fn start(config: &AudioConfig) -> AudioInput {
        let (frame_tx, frames) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let active = Arc::new(AtomicBool::new(true));
        let muted = Arc::new(AtomicBool::new(false));

        let frame_size = config.frame_size_samples();
        let mut ticker = tokio::time::interval(config.frame_duration());
        let running = active.clone();
        tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                if frame_tx.send(vec![0.0; frame_size]).await.is_err() {
                    break;
                }
            }
        });

        debug!("Silent capture started");
        AudioInput {
            frames,
            capture: Box::new(Self { active, muted }),
        }
    }
}

impl AudioCapture for SilentCapture {
    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        debug!(muted, "Audio mute state changed");
    }

    fn stop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!("Silent capture stopped");
        }
    }
}

impl Drop for SilentCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "audio-device")]
mod device {
    //! cpal streams are not `Send`, so each one lives on its own thread
    //! until told to stop.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tokio::sync::{mpsc, oneshot};
    use tracing::{debug, error, info, warn};

    use super::{AudioConfig, AudioOutput, FRAME_CHANNEL_CAPACITY};
    use crate::backend::{AudioCapture, AudioFrame, AudioInput};
    use crate::error::MediaError;

    pub struct DeviceCapture {
        muted: Arc<AtomicBool>,
        stop_tx: Option<std::sync::mpsc::Sender<()>>,
    }

    impl AudioCapture for DeviceCapture {
        fn set_muted(&self, muted: bool) {
            self.muted.store(muted, Ordering::SeqCst);
            debug!(muted, "Audio mute state changed");
        }

        fn stop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
                debug!("Audio capture stopped");
            }
        }
    }

    impl Drop for DeviceCapture {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn stream_config(config: &AudioConfig) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }

    fn map_build_error(e: cpal::BuildStreamError, missing: MediaError) -> MediaError {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => missing,
            cpal::BuildStreamError::StreamConfigNotSupported
            | cpal::BuildStreamError::InvalidArgument => MediaError::Unsupported,
            cpal::BuildStreamError::BackendSpecific { err }
                if err.description.to_lowercase().contains("permission") =>
            {
                MediaError::PermissionDenied
            }
            other => MediaError::Device(other.to_string()),
        }
    }

    /// Run `build` on a dedicated thread and keep the stream it returns
    /// alive until the returned sender fires or is dropped.
    async fn spawn_stream<F>(name: &str, build: F) -> Result<std::sync::mpsc::Sender<()>, MediaError>
    where
        F: FnOnce() -> Result<cpal::Stream, MediaError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|stream| {
                    stream
                        .play()
                        .map_err(|e| MediaError::Device(e.to_string()))?;
                    Ok(stream)
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| MediaError::Device(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| MediaError::Device("audio thread exited".into()))??;
        Ok(stop_tx)
    }

    pub async fn start_capture(config: &AudioConfig) -> Result<AudioInput, MediaError> {
        let (frame_tx, frames) = mpsc::channel::<AudioFrame>(FRAME_CHANNEL_CAPACITY);
        let muted = Arc::new(AtomicBool::new(false));
        let muted_cb = muted.clone();
        let config = config.clone();

        let stop_tx = spawn_stream("causerie-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or(MediaError::NoInputDevice)?;
            info!(device = ?device.name(), "Using input device");

            let frame_size = config.frame_size_samples();
            let mut buffer = Vec::with_capacity(frame_size);
            device
                .build_input_stream(
                    &stream_config(&config),
                    move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                        if muted_cb.load(Ordering::Relaxed) {
                            // Silence keeps the remote side's jitter buffer fed
                            buffer.resize(buffer.len() + data.len(), 0.0);
                        } else {
                            buffer.extend_from_slice(data);
                        }
                        while buffer.len() >= frame_size {
                            let frame: AudioFrame = buffer.drain(..frame_size).collect();
                            if frame_tx.try_send(frame).is_err() {
                                warn!("Audio frame channel full, dropping frame");
                            }
                        }
                    },
                    move |err| {
                        error!("Audio input error: {err}");
                    },
                    None,
                )
                .map_err(|e| map_build_error(e, MediaError::NoInputDevice))
        })
        .await?;

        debug!("Audio capture started");
        Ok(AudioInput {
            frames,
            capture: Box::new(DeviceCapture {
                muted,
                stop_tx: Some(stop_tx),
            }),
        })
    }

    pub async fn start_playback(
        config: &AudioConfig,
        mut frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<AudioOutput, MediaError> {
        let (playback_tx, playback_rx) = std::sync::mpsc::channel::<AudioFrame>();
        let config = config.clone();

        let stop_tx = spawn_stream("causerie-playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or(MediaError::NoOutputDevice)?;
            info!(device = ?device.name(), "Using output device");

            let mut play_buffer: VecDeque<f32> = VecDeque::new();
            device
                .build_output_stream(
                    &stream_config(&config),
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                        while let Ok(frame) = playback_rx.try_recv() {
                            play_buffer.extend(frame);
                        }
                        for sample in data.iter_mut() {
                            *sample = play_buffer.pop_front().unwrap_or(0.0);
                        }
                    },
                    move |err| {
                        error!("Audio output error: {err}");
                    },
                    None,
                )
                .map_err(|e| map_build_error(e, MediaError::NoOutputDevice))
        })
        .await?;

        // Bridge the tokio channel to the callback's std channel
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if playback_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        debug!("Audio playback started");
        Ok(AudioOutput {
            stop_tx: Some(stop_tx),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(AudioConfig::default().frame_size_samples(), 960);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_capture_produces_frames_until_stopped() {
        let mut input = SilentCapture::start(&AudioConfig::default());
        let frame = input.frames.recv().await.unwrap();
        assert_eq!(frame.len(), 960);
        assert!(frame.iter().all(|s| *s == 0.0));

        input.capture.stop();
        input.capture.stop();
        // The producer notices the flag on its next tick and closes.
        while input.frames.recv().await.is_some() {}
    }
}
