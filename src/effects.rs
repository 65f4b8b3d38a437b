//! Side-effect coordinator.
//!
//! Translates state-machine transitions into recording and audio-route
//! actions: entering `Connected` starts routing and (policy permitting)
//! recording; entering `Ending` stops the recorder, hands the artifact to
//! the uploader, and shuts routing down. Every failure in here is non-fatal
//! to the call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};

use crate::error::CallError;
use crate::upload::{CallRecord, CallRecordMeta, RecordingUploader};

/// Media mode for the audio routing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioMode {
    #[default]
    Audio,
    Video,
}

/// In-call audio routing (speaker/earpiece) capability.
#[async_trait]
pub trait AudioRouter: Send + Sync {
    async fn start(&self, mode: AudioMode);
    async fn stop(&self);
    async fn set_speakerphone_on(&self, on: bool);
}

/// Encoder settings handed to the recording service.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub encoder: String,
    pub channels: u8,
    pub sample_rate: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            encoder: "aac".to_string(),
            channels: 2,
            sample_rate: 44_100,
        }
    }
}

/// A captured audio file, produced when the recorder stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingArtifact {
    pub path: PathBuf,
    pub duration_ms: u64,
    pub size_bytes: u64,
}

/// In-call audio recording capability.
#[async_trait]
pub trait CallRecorder: Send + Sync {
    async fn start(&self, path: &Path, config: &EncoderConfig) -> Result<(), CallError>;
    async fn stop(&self) -> Result<RecordingArtifact, CallError>;
}

pub struct SideEffectCoordinator {
    router: Arc<dyn AudioRouter>,
    recorder: Arc<dyn CallRecorder>,
    uploader: Arc<dyn RecordingUploader>,
    recordings_dir: PathBuf,
    encoder: EncoderConfig,
    recording: bool,
    routing: bool,
}

impl SideEffectCoordinator {
    pub fn new(
        router: Arc<dyn AudioRouter>,
        recorder: Arc<dyn CallRecorder>,
        uploader: Arc<dyn RecordingUploader>,
        recordings_dir: PathBuf,
    ) -> Self {
        Self {
            router,
            recorder,
            uploader,
            recordings_dir,
            encoder: EncoderConfig::default(),
            recording: false,
            routing: false,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Entering `Connected`: bring up audio routing and start recording
    /// when this side's policy says so.
    pub async fn on_connected(&mut self, speaker_on: bool, should_record: bool) {
        self.router.start(AudioMode::Audio).await;
        self.router.set_speakerphone_on(speaker_on).await;
        self.routing = true;

        if !should_record {
            return;
        }
        let path = self
            .recordings_dir
            .join(format!("recording_{}.mp3", Utc::now().timestamp_millis()));
        match self.recorder.start(&path, &self.encoder).await {
            Ok(()) => {
                info!("Recording started: {}", path.display());
                self.recording = true;
            }
            // The call runs fine without a recording.
            Err(e) => warn!("Recording did not start: {e}"),
        }
    }

    pub async fn set_speaker(&self, on: bool) {
        self.router.set_speakerphone_on(on).await;
    }

    /// Entering `Ending`: flush the recording to the uploader, then stop
    /// audio routing. Upload failures never block teardown.
    pub async fn on_ending(&mut self, meta: Option<CallRecordMeta>) {
        if self.recording {
            self.recording = false;
            match self.recorder.stop().await {
                Ok(artifact) => match meta {
                    Some(meta) => {
                        let record = CallRecord::new(meta, artifact);
                        if let Err(e) = self.uploader.upload(&record).await {
                            warn!("Recording upload failed, discarding artifact: {e}");
                        }
                    }
                    None => debug!("Recording stopped with no call metadata, discarding"),
                },
                Err(e) => warn!("Stopping recorder failed: {e}"),
            }
        }

        if self.routing {
            self.routing = false;
            self.router.stop().await;
            self.router.set_speakerphone_on(false).await;
        }
    }
}
