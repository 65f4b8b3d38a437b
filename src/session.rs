//! Call session orchestration.
//!
//! A [`CallSession`] is one call attempt: it owns the signaling transport,
//! the peer session, the lifecycle state machine, and the side-effect
//! coordinator, and runs them from a single task. The embedding layer talks
//! to it through a command channel and listens on an event channel.
//!
//! [`CallManager`] enforces the one-active-call rule and spawns sessions.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, mpsc};

use crate::config::{CallConfig, RecordingPolicy};
use crate::effects::{AudioRouter, CallRecorder, SideEffectCoordinator};
use crate::envelope::SignalEnvelope;
use crate::error::CallError;
use crate::events::SessionEvent;
use crate::peer::{
    CameraFacing, IceConfig, MediaDevices, PeerConnectionFactory, PeerEvent, PeerSession,
};
use crate::state::{CallRole, CallState, CallTransition, EndReason};
use crate::transport::{SignalingTransport, TransportEvent, TransportFactory};
use crate::upload::{CallRecordMeta, RecordingUploader};

/// Identity of one call attempt.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub local_user_id: String,
    pub remote_user_id: String,
    pub role: CallRole,
    /// Role string carried on the wire in `join` and `endedBy`, e.g.
    /// `"DOCTOR"` or `"PATIENT"`.
    pub role_label: String,
}

/// Local user intents, delivered over the session's command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    EndCall,
    ToggleMute,
    ToggleVideo,
    ToggleSpeaker,
    SwitchCamera,
    /// Ask the remote party to unmute.
    RequestUnmute,
    /// Answer the remote party's unmute request.
    RespondUnmute { accept: bool },
}

/// The pluggable capabilities a session runs against. Production wires the
/// WebSocket transport, the platform WebRTC stack, and the HTTP uploader;
/// tests wire mocks.
#[derive(Clone)]
pub struct Collaborators {
    pub transport_factory: Arc<dyn TransportFactory>,
    pub media_devices: Arc<dyn MediaDevices>,
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    pub audio_router: Arc<dyn AudioRouter>,
    pub recorder: Arc<dyn CallRecorder>,
    pub uploader: Arc<dyn RecordingUploader>,
}

/// One call attempt, driven by [`run`](CallSession::run).
pub struct CallSession {
    config: CallConfig,
    params: SessionParams,
    transport_factory: Arc<dyn TransportFactory>,
    transport: Option<Arc<dyn SignalingTransport>>,
    peer: PeerSession,
    effects: SideEffectCoordinator,
    state: CallState,
    events_tx: mpsc::Sender<SessionEvent>,
    awaiting_unmute: bool,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        collaborators: Collaborators,
        params: SessionParams,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let peer = PeerSession::new(
            collaborators.media_devices,
            collaborators.peer_factory,
            IceConfig {
                ice_servers: config.ice_servers.clone(),
            },
            config.speaker_on,
        );
        let effects = SideEffectCoordinator::new(
            collaborators.audio_router,
            collaborators.recorder,
            collaborators.uploader,
            config.recordings_dir.clone(),
        );
        Self {
            config,
            params,
            transport_factory: collaborators.transport_factory,
            transport: None,
            peer,
            effects,
            state: CallState::Idle,
            events_tx,
            awaiting_unmute: false,
        }
    }

    /// Runs the session to completion. Returns once the state machine
    /// reaches `Ended`.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut transport_rx = match self.start().await {
            Ok(rx) => rx,
            Err(e) => {
                error!("Call session failed to start: {e}");
                self.teardown(end_reason_for(&e), None, false).await;
                return;
            }
        };

        // Peer events only exist after local media comes up.
        let mut peer_rx: Option<mpsc::Receiver<PeerEvent>> = None;
        // Armed while an unmute request we sent is unanswered and a bound
        // is configured. An expired request is reported as declined.
        let mut unmute_sleep: Option<Pin<Box<tokio::time::Sleep>>> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Handle dropped: the embedder is gone, hang up.
                    None => {
                        self.teardown(
                            EndReason::LocalHangup,
                            Some(self.params.role_label.clone()),
                            true,
                        )
                        .await;
                    }
                },
                event = transport_rx.recv() => match event {
                    Some(event) => {
                        if let Some(rx) = self.handle_transport_event(event).await {
                            peer_rx = Some(rx);
                        }
                    }
                    None => {
                        if !self.state.is_shutting_down() {
                            warn!("Signaling event channel closed unexpectedly");
                            self.teardown(EndReason::SignalingFailure, None, false).await;
                        }
                    }
                },
                event = async {
                    match peer_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => peer_rx = None,
                },
                () = async {
                    match unmute_sleep.as_mut() {
                        Some(sleep) => sleep.as_mut().await,
                        None => std::future::pending().await,
                    }
                } => {
                    debug!("Unmute request timed out");
                    self.awaiting_unmute = false;
                    self.emit(SessionEvent::UnmuteAnswered { accepted: false })
                        .await;
                },
            }

            match (self.awaiting_unmute, self.config.unmute_timeout) {
                (true, Some(bound)) => {
                    if unmute_sleep.is_none() {
                        unmute_sleep = Some(Box::pin(tokio::time::sleep(bound)));
                    }
                }
                _ => unmute_sleep = None,
            }

            if self.state.is_ended() {
                return;
            }
        }
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, CallError> {
        info!(
            "Starting call: {} -> {} as {:?}",
            self.params.local_user_id, self.params.remote_user_id, self.params.role
        );
        self.state.apply_transition(CallTransition::Started)?;
        self.emit_state().await;

        let (transport, rx) = self
            .transport_factory
            .connect(&self.config.signaling_url)
            .await?;
        self.transport = Some(transport);
        Ok(rx)
    }

    async fn handle_transport_event(
        &mut self,
        event: TransportEvent,
    ) -> Option<mpsc::Receiver<PeerEvent>> {
        match event {
            TransportEvent::Opened => self.on_signaling_open().await,
            TransportEvent::Message(envelope) => {
                self.handle_envelope(envelope).await;
                None
            }
            TransportEvent::Error(e) => {
                if !self.state.is_shutting_down() {
                    error!("Signaling transport failed: {e}");
                    self.teardown(EndReason::SignalingFailure, None, false).await;
                }
                None
            }
            TransportEvent::Closed => {
                if !self.state.is_shutting_down() {
                    warn!("Signaling connection closed mid-call");
                    self.teardown(EndReason::SignalingFailure, None, false).await;
                }
                None
            }
        }
    }

    /// Transport is up: announce ourselves, bring up local media, and (as
    /// caller) open negotiation.
    async fn on_signaling_open(&mut self) -> Option<mpsc::Receiver<PeerEvent>> {
        if self
            .state
            .apply_transition(CallTransition::TransportOpened {
                role: self.params.role,
            })
            .is_err()
        {
            debug!("Ignoring transport open in state {}", self.state.name());
            return None;
        }
        self.emit_state().await;

        self.send(SignalEnvelope::Join {
            user_id: self.params.local_user_id.clone(),
            role: self.params.role_label.clone(),
        })
        .await;
        if !self.params.role.is_caller() {
            // Answering means we already accepted; tell the caller.
            self.send(SignalEnvelope::CallAccepted {
                from: self.params.local_user_id.clone(),
                to: self.params.remote_user_id.clone(),
            })
            .await;
        }

        let peer_rx = match self.peer.acquire_local_media(CameraFacing::Front).await {
            Ok(rx) => rx,
            Err(e) => {
                error!("Local media acquisition failed: {e}");
                self.teardown(EndReason::MediaFailure, None, true).await;
                return None;
            }
        };
        if self.state.is_shutting_down() {
            return None;
        }

        if self.params.role.is_caller() {
            match self.peer.create_offer().await {
                Ok(offer) => {
                    self.send(SignalEnvelope::Offer {
                        offer,
                        target: Some(self.params.remote_user_id.clone()),
                        from: Some(self.params.local_user_id.clone()),
                    })
                    .await;
                }
                Err(e) => {
                    error!("Offer creation failed: {e}");
                    self.teardown(EndReason::NegotiationFailure, None, true)
                        .await;
                    return None;
                }
            }
        }
        Some(peer_rx)
    }

    async fn handle_envelope(&mut self, envelope: SignalEnvelope) {
        if self.state.is_shutting_down() {
            debug!("Ignoring {} during teardown", envelope.label());
            return;
        }
        // Messages from or for someone other than this call's two parties
        // are dropped.
        if let Some(from) = envelope.sender() {
            if from != self.params.remote_user_id {
                debug!("Ignoring {} from unexpected peer {from}", envelope.label());
                return;
            }
        }
        if let Some(to) = envelope.recipient() {
            if to != self.params.local_user_id {
                debug!("Ignoring {} addressed to {to}", envelope.label());
                return;
            }
        }

        match envelope {
            SignalEnvelope::Offer { offer, .. } => {
                if self.state != CallState::Answering {
                    debug!("Ignoring offer in state {}", self.state.name());
                    return;
                }
                if let Err(e) = self.peer.apply_remote_description(&offer).await {
                    error!("Applying remote offer failed: {e}");
                    self.teardown(EndReason::NegotiationFailure, None, true)
                        .await;
                    return;
                }
                if self.state.is_shutting_down() {
                    return;
                }
                match self.peer.create_answer().await {
                    Ok(answer) => {
                        self.send(SignalEnvelope::Answer {
                            answer,
                            target: Some(self.params.remote_user_id.clone()),
                            from: Some(self.params.local_user_id.clone()),
                        })
                        .await;
                        if self
                            .state
                            .apply_transition(CallTransition::OfferApplied)
                            .is_ok()
                        {
                            self.emit_state().await;
                        }
                    }
                    Err(e) => {
                        error!("Answer creation failed: {e}");
                        self.teardown(EndReason::NegotiationFailure, None, true)
                            .await;
                    }
                }
            }
            SignalEnvelope::Answer { answer, .. } => {
                if self.state != CallState::Offering {
                    debug!("Ignoring answer in state {}", self.state.name());
                    return;
                }
                if let Err(e) = self.peer.apply_remote_description(&answer).await {
                    error!("Applying remote answer failed: {e}");
                    self.teardown(EndReason::NegotiationFailure, None, true)
                        .await;
                    return;
                }
                if self
                    .state
                    .apply_transition(CallTransition::AnswerApplied)
                    .is_ok()
                {
                    self.emit_state().await;
                }
            }
            SignalEnvelope::Candidate { candidate, .. } => {
                if !self.state.accepts_candidates() {
                    debug!("Ignoring candidate in state {}", self.state.name());
                    return;
                }
                // A single bad candidate is not worth ending the call over.
                if let Err(e) = self.peer.add_remote_candidate(&candidate).await {
                    warn!("Remote candidate rejected: {e}");
                }
            }
            SignalEnvelope::EndCall { ended_by, .. } => {
                info!("Remote party ({ended_by}) ended the call");
                self.emit(SessionEvent::RemoteEnded {
                    ended_by: ended_by.clone(),
                })
                .await;
                self.teardown(EndReason::RemoteHangup, Some(ended_by), false)
                    .await;
            }
            SignalEnvelope::CallRejected { from, .. } => {
                info!("Call rejected by {from}");
                self.teardown(EndReason::Rejected, Some(from), false).await;
            }
            SignalEnvelope::CallAccepted { from, .. } => {
                debug!("Call accepted by {from}");
            }
            SignalEnvelope::MuteStatus { is_muted, .. } => {
                // The remote unmuting on their own settles a pending unmute
                // request; without this the requester would still see a
                // timeout-decline later.
                if !is_muted && self.awaiting_unmute {
                    self.awaiting_unmute = false;
                    self.emit(SessionEvent::UnmuteAnswered { accepted: true })
                        .await;
                }
                self.emit(SessionEvent::RemoteMuteChanged { muted: is_muted })
                    .await;
            }
            SignalEnvelope::UnmuteRequest { .. } => {
                if !self.state.is_connected() {
                    debug!("Ignoring unmute request in state {}", self.state.name());
                    return;
                }
                if self.peer.flags().muted {
                    self.emit(SessionEvent::UnmuteRequested).await;
                } else {
                    // Already unmuted; answer for the user.
                    self.send(SignalEnvelope::UnmuteResponse {
                        from: self.params.local_user_id.clone(),
                        to: self.params.remote_user_id.clone(),
                        accepted: true,
                    })
                    .await;
                }
            }
            SignalEnvelope::UnmuteResponse { accepted, .. } => {
                if self.awaiting_unmute {
                    self.awaiting_unmute = false;
                    self.emit(SessionEvent::UnmuteAnswered { accepted }).await;
                } else {
                    debug!("Ignoring unsolicited unmute response");
                }
            }
            SignalEnvelope::Join { user_id, .. } => {
                debug!("Peer {user_id} joined the signaling room");
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        if self.state.is_shutting_down() {
            debug!("Ignoring {command:?} during teardown");
            return;
        }
        match command {
            SessionCommand::EndCall => {
                self.teardown(
                    EndReason::LocalHangup,
                    Some(self.params.role_label.clone()),
                    true,
                )
                .await;
            }
            SessionCommand::ToggleMute => {
                let muted = self.peer.set_muted(!self.peer.flags().muted);
                self.emit(SessionEvent::LocalMuteChanged { muted }).await;
                self.send(SignalEnvelope::MuteStatus {
                    from: self.params.local_user_id.clone(),
                    to: self.params.remote_user_id.clone(),
                    is_muted: muted,
                })
                .await;
            }
            SessionCommand::ToggleVideo => {
                let enabled = self.peer.set_video_enabled(!self.peer.flags().video_enabled);
                self.emit(SessionEvent::LocalVideoChanged { enabled }).await;
            }
            SessionCommand::ToggleSpeaker => {
                let on = !self.peer.flags().speaker_on;
                self.peer.set_speaker_on(on);
                self.effects.set_speaker(on).await;
                self.emit(SessionEvent::SpeakerChanged { speaker_on: on })
                    .await;
            }
            SessionCommand::SwitchCamera => {
                let current = if self.peer.flags().front_camera {
                    CameraFacing::Front
                } else {
                    CameraFacing::Back
                };
                let target = current.flipped();
                if self.peer.replace_video_track(target).await {
                    self.emit(SessionEvent::CameraSwitched {
                        front: target.is_front(),
                    })
                    .await;
                }
            }
            SessionCommand::RequestUnmute => {
                if !self.state.is_connected() {
                    debug!("Ignoring unmute request before the call connects");
                    return;
                }
                self.awaiting_unmute = true;
                self.send(SignalEnvelope::UnmuteRequest {
                    from: self.params.local_user_id.clone(),
                    to: self.params.remote_user_id.clone(),
                })
                .await;
            }
            SessionCommand::RespondUnmute { accept } => {
                self.send(SignalEnvelope::UnmuteResponse {
                    from: self.params.local_user_id.clone(),
                    to: self.params.remote_user_id.clone(),
                    accepted: accept,
                })
                .await;
                if accept {
                    let muted = self.peer.set_muted(false);
                    self.emit(SessionEvent::LocalMuteChanged { muted }).await;
                    self.send(SignalEnvelope::MuteStatus {
                        from: self.params.local_user_id.clone(),
                        to: self.params.remote_user_id.clone(),
                        is_muted: muted,
                    })
                    .await;
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.state.is_shutting_down() {
            return;
        }
        match event {
            PeerEvent::IceCandidate(candidate) => {
                self.send(SignalEnvelope::Candidate {
                    candidate,
                    target: Some(self.params.remote_user_id.clone()),
                    from: Some(self.params.local_user_id.clone()),
                })
                .await;
            }
            PeerEvent::RemoteTrack { track_count } => {
                // Only the first arrival moves the state machine.
                let first_arrival = !self.peer.has_remote_media();
                self.peer.note_remote_tracks(track_count);
                if first_arrival
                    && self
                        .state
                        .apply_transition(CallTransition::RemoteMediaArrived)
                        .is_ok()
                {
                    info!("Remote media arrived, call connected");
                    self.emit_state().await;
                    self.emit(SessionEvent::RemoteMediaArrived).await;
                    let speaker_on = self.peer.flags().speaker_on;
                    let should_record = self.should_record();
                    self.effects.on_connected(speaker_on, should_record).await;
                }
            }
        }
    }

    /// Ends the call. At most one invocation does work; the rest are no-ops,
    /// so overlapping end paths (local hangup, remote `end_call`, transport
    /// failure) cannot double-release anything.
    async fn teardown(&mut self, reason: EndReason, ended_by: Option<String>, send_end: bool) {
        if self.state.is_shutting_down() {
            debug!("Teardown already in progress, ignoring {reason:?}");
            return;
        }
        if self
            .state
            .apply_transition(CallTransition::EndRequested {
                reason,
                ended_by: ended_by.clone(),
            })
            .is_err()
        {
            return;
        }
        info!("Ending call: {reason:?}");
        self.emit_state().await;

        let meta = self.state.connected_at().map(|start_time| CallRecordMeta {
            caller_id: self.caller_id().to_string(),
            receiver_id: self.receiver_id().to_string(),
            start_time,
            ended_by: ended_by
                .clone()
                .unwrap_or_else(|| self.params.role_label.clone()),
        });
        self.effects.on_ending(meta).await;

        if send_end {
            self.send(SignalEnvelope::EndCall {
                from: self.params.local_user_id.clone(),
                to: self.params.remote_user_id.clone(),
                ended_by: self.params.role_label.clone(),
            })
            .await;
        }

        self.peer.close().await;
        if let Some(transport) = &self.transport {
            transport.close().await;
        }

        if self
            .state
            .apply_transition(CallTransition::TeardownComplete)
            .is_ok()
        {
            self.emit_state().await;
        }
        self.emit(SessionEvent::Ended { reason }).await;
    }

    fn should_record(&self) -> bool {
        match self.config.recording_policy {
            RecordingPolicy::CallerOnly => self.params.role.is_caller(),
            RecordingPolicy::BothSides => true,
            RecordingPolicy::Disabled => false,
        }
    }

    fn caller_id(&self) -> &str {
        if self.params.role.is_caller() {
            &self.params.local_user_id
        } else {
            &self.params.remote_user_id
        }
    }

    fn receiver_id(&self) -> &str {
        if self.params.role.is_caller() {
            &self.params.remote_user_id
        } else {
            &self.params.local_user_id
        }
    }

    async fn send(&self, envelope: SignalEnvelope) {
        if let Some(transport) = &self.transport {
            transport.send(&envelope).await;
        } else {
            debug!("No transport yet, dropping {}", envelope.label());
        }
    }

    async fn emit(&self, event: SessionEvent) {
        // A dropped event receiver must not stall the session.
        let _ = self.events_tx.send(event).await;
    }

    async fn emit_state(&self) {
        self.emit(SessionEvent::StateChanged(self.state.clone()))
            .await;
    }
}

fn end_reason_for(error: &CallError) -> EndReason {
    match error {
        CallError::MediaAccess(_) => EndReason::MediaFailure,
        CallError::Negotiation(_) | CallError::InvalidTransition(_) => {
            EndReason::NegotiationFailure
        }
        _ => EndReason::SignalingFailure,
    }
}

/// Handle to a running session.
pub struct CallSessionHandle {
    pub commands: mpsc::Sender<SessionCommand>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Entry point for placing and answering calls. Holds the single-active-call
/// invariant: a second `start_call` while one is running returns
/// [`CallError::Busy`].
pub struct CallManager {
    config: CallConfig,
    collaborators: Collaborators,
    active: Mutex<Option<Arc<AtomicBool>>>,
}

impl CallManager {
    pub fn new(config: CallConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            active: Mutex::new(None),
        }
    }

    /// Spawns a call session. The returned handle carries the command sender
    /// and the event stream for this one call.
    pub async fn start_call(&self, params: SessionParams) -> Result<CallSessionHandle, CallError> {
        let mut active = self.active.lock().await;
        if let Some(ended) = active.as_ref() {
            if !ended.load(Ordering::Acquire) {
                return Err(CallError::Busy);
            }
        }
        let ended = Arc::new(AtomicBool::new(false));
        *active = Some(ended.clone());
        drop(active);

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(64);
        let session = CallSession::new(
            self.config.clone(),
            self.collaborators.clone(),
            params,
            events_tx,
        );
        tokio::task::spawn(async move {
            session.run(commands_rx).await;
            ended.store(true, Ordering::Release);
        });

        Ok(CallSessionHandle {
            commands: commands_tx,
            events: events_rx,
        })
    }

    /// Declines an incoming call without starting a session: joins the
    /// signaling room, sends `call_rejected`, and closes. Allowed even while
    /// another call is active.
    pub async fn reject_call(&self, params: SessionParams) -> Result<(), CallError> {
        let (transport, mut rx) = self
            .collaborators
            .transport_factory
            .connect(&self.config.signaling_url)
            .await?;
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Opened => break,
                TransportEvent::Error(e) => return Err(CallError::Transport(e)),
                _ => {}
            }
        }
        transport
            .send(&SignalEnvelope::Join {
                user_id: params.local_user_id.clone(),
                role: params.role_label.clone(),
            })
            .await;
        transport
            .send(&SignalEnvelope::CallRejected {
                from: params.local_user_id,
                to: params.remote_user_id,
            })
            .await;
        transport.close().await;
        Ok(())
    }
}
