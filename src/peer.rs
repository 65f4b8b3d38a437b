//! Peer session controller.
//!
//! Wraps exactly one peer-connection object and one local capture stream per
//! call. The underlying WebRTC primitive, the capture device, and the tracks
//! they yield sit behind traits; this module owns the negotiation and media
//! state that drives them.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::envelope::{IceCandidate, SessionDescription};
use crate::error::CallError;

/// Camera selection for capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraFacing {
    #[default]
    Front,
    Back,
}

impl CameraFacing {
    pub fn flipped(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }

    pub fn is_front(self) -> bool {
        matches!(self, Self::Front)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Capture constraints handed to the media device.
#[derive(Debug, Clone)]
pub struct CaptureConstraints {
    pub facing: CameraFacing,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub audio: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            facing: CameraFacing::Front,
            width: 640,
            height: 480,
            frame_rate: 30,
            audio: true,
        }
    }
}

impl CaptureConstraints {
    pub fn facing(facing: CameraFacing) -> Self {
        Self {
            facing,
            ..Self::default()
        }
    }
}

/// ICE server list handed to the peer-connection factory.
#[derive(Debug, Clone, Default)]
pub struct IceConfig {
    pub ice_servers: Vec<String>,
}

/// One local or remote media track. `enabled` carries mute/video-off;
/// `stop` releases the capture.
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

/// Local capture stream: camera plus microphone tracks.
pub struct LocalMedia {
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalMedia {
    pub fn audio_track(&self) -> Option<&Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Camera/microphone capture capability.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Requests a capture stream. Failure means denied permission or a
    /// hardware fault; the caller must terminate the session, no retry.
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalMedia, CallError>;
}

/// Events emitted by the peer-connection primitive.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate is ready to be signaled to the peer.
    IceCandidate(IceCandidate),
    /// Remote media arrived.
    RemoteTrack { track_count: usize },
}

/// Standard WebRTC-style peer connection contract.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Produces an offer and sets it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    /// Produces an answer and sets it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError>;
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), CallError>;
    /// Swaps the outbound video sender's track.
    async fn replace_video_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), CallError>;
    /// Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &IceConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), CallError>;
}

/// UI-visible media flags, derived state only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFlags {
    pub muted: bool,
    pub video_enabled: bool,
    pub speaker_on: bool,
    pub front_camera: bool,
}

impl Default for MediaFlags {
    fn default() -> Self {
        Self {
            muted: false,
            video_enabled: true,
            speaker_on: true,
            front_camera: true,
        }
    }
}

/// Owns the one peer connection and local stream of a call session.
pub struct PeerSession {
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    ice: IceConfig,
    pc: Option<Arc<dyn PeerConnection>>,
    local: Option<LocalMedia>,
    flags: MediaFlags,
    remote_tracks: usize,
    closed: bool,
}

impl PeerSession {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        ice: IceConfig,
        speaker_on: bool,
    ) -> Self {
        Self {
            devices,
            factory,
            ice,
            pc: None,
            local: None,
            flags: MediaFlags {
                speaker_on,
                ..Default::default()
            },
            remote_tracks: 0,
            closed: false,
        }
    }

    pub fn flags(&self) -> MediaFlags {
        self.flags
    }

    pub fn has_remote_media(&self) -> bool {
        self.remote_tracks > 0
    }

    pub fn note_remote_tracks(&mut self, track_count: usize) {
        self.remote_tracks = self.remote_tracks.max(track_count);
    }

    /// Requests camera+microphone and wires the capture into a freshly
    /// created peer connection. Returns the peer event stream.
    pub async fn acquire_local_media(
        &mut self,
        facing: CameraFacing,
    ) -> Result<mpsc::Receiver<PeerEvent>, CallError> {
        let media = self
            .devices
            .get_user_media(&CaptureConstraints::facing(facing))
            .await?;

        // From here on the capture is live; release it on every failure arm
        // or the camera/microphone stay held after the session dies.
        let (pc, events) = match self.factory.create(&self.ice).await {
            Ok(created) => created,
            Err(e) => {
                media.stop_all();
                return Err(e);
            }
        };
        for track in &media.tracks {
            if let Err(e) = pc.add_track(track.clone()).await {
                media.stop_all();
                pc.close().await;
                return Err(e);
            }
        }

        self.flags.front_camera = facing.is_front();
        self.local = Some(media);
        self.pc = Some(pc);
        Ok(events)
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let pc = self.require_pc("create_offer")?;
        pc.create_offer().await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let pc = self.require_pc("create_answer")?;
        pc.create_answer().await
    }

    /// Applies a remote description. Without a peer connection this is a
    /// tolerated no-op, matching the original client.
    pub async fn apply_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), CallError> {
        match &self.pc {
            Some(pc) => pc.set_remote_description(desc).await,
            None => {
                debug!("Ignoring remote description: no peer connection yet");
                Ok(())
            }
        }
    }

    /// Adds a remote ICE candidate; no-op without a peer connection.
    pub async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        match &self.pc {
            Some(pc) => pc.add_ice_candidate(candidate).await,
            None => {
                debug!("Ignoring remote candidate: no peer connection yet");
                Ok(())
            }
        }
    }

    /// Switches cameras by acquiring a fresh capture and swapping the video
    /// sender's track. Non-fatal: on any failure the call continues with the
    /// previous track and `false` is returned.
    pub async fn replace_video_track(&mut self, facing: CameraFacing) -> bool {
        let Some(pc) = self.pc.clone() else {
            return false;
        };

        let constraints = CaptureConstraints {
            facing,
            audio: false,
            ..CaptureConstraints::default()
        };
        let fresh = match self.devices.get_user_media(&constraints).await {
            Ok(media) => media,
            Err(e) => {
                warn!("Camera switch capture failed, keeping current track: {e}");
                return false;
            }
        };
        let Some(new_track) = fresh.video_track().cloned() else {
            warn!("Camera switch produced no video track, keeping current track");
            fresh.stop_all();
            return false;
        };

        if let Err(e) = pc.replace_video_track(new_track.clone()).await {
            warn!("Camera switch failed, keeping current track: {e}");
            new_track.stop();
            return false;
        }

        new_track.set_enabled(self.flags.video_enabled);
        if let Some(local) = &mut self.local {
            if let Some(old) = local.video_track() {
                old.stop();
            }
            local.tracks.retain(|t| t.kind() != TrackKind::Video);
            local.tracks.push(new_track);
        }
        self.flags.front_camera = facing.is_front();
        true
    }

    /// Sets the mute flag by toggling the audio track's `enabled` state.
    /// Returns the new effective flag: with no audio track the state is
    /// reported unchanged.
    pub fn set_muted(&mut self, muted: bool) -> bool {
        if let Some(track) = self.local.as_ref().and_then(|m| m.audio_track()) {
            track.set_enabled(!muted);
            self.flags.muted = muted;
        }
        self.flags.muted
    }

    /// Same contract as [`set_muted`](Self::set_muted), for the video track.
    pub fn set_video_enabled(&mut self, enabled: bool) -> bool {
        if let Some(track) = self.local.as_ref().and_then(|m| m.video_track()) {
            track.set_enabled(enabled);
            self.flags.video_enabled = enabled;
        }
        self.flags.video_enabled
    }

    pub fn set_speaker_on(&mut self, on: bool) {
        self.flags.speaker_on = on;
    }

    /// Releases every track and the peer connection. Safe to call multiple
    /// times; tracks are stopped exactly once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(local) = self.local.take() {
            local.stop_all();
        }
        if let Some(pc) = self.pc.take() {
            pc.close().await;
        }
        self.remote_tracks = 0;
    }

    fn require_pc(&self, op: &str) -> Result<&Arc<dyn PeerConnection>, CallError> {
        self.pc
            .as_ref()
            .ok_or_else(|| CallError::Negotiation(format!("{op} without a peer connection")))
    }
}
