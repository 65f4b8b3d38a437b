//! End-to-end session scenarios over mock collaborators.
//!
//! Each test runs a real session task and drives it through the command
//! channel, injected signaling traffic, and injected peer events, then
//! asserts on what was sent, what was released, and what the embedder saw.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::timeout;

use crate::config::{CallConfig, RecordingPolicy};
use crate::effects::mock::{MockAudioRouter, MockRecorder, MockUploader};
use crate::envelope::{IceCandidate, SdpType, SessionDescription, SignalEnvelope};
use crate::events::SessionEvent;
use crate::peer::PeerEvent;
use crate::peer::mock::{MockMediaDevices, MockPeerFactory};
use crate::session::{
    CallManager, CallSessionHandle, Collaborators, SessionCommand, SessionParams,
};
use crate::state::{CallRole, EndReason};
use crate::transport::TransportEvent;
use crate::transport::mock::{MockTransport, MockTransportFactory};

struct Harness {
    manager: CallManager,
    signal_tx: tokio::sync::mpsc::Sender<TransportEvent>,
    transport: Arc<MockTransport>,
    devices: Arc<MockMediaDevices>,
    peer_factory: Arc<MockPeerFactory>,
    router: Arc<MockAudioRouter>,
    recorder: Arc<MockRecorder>,
    uploader: Arc<MockUploader>,
}

fn harness(config: CallConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let (transport_factory, signal_tx, transport) = MockTransportFactory::new();
    let devices = MockMediaDevices::new();
    let peer_factory = MockPeerFactory::new();
    let router = MockAudioRouter::new();
    let recorder = MockRecorder::new();
    let uploader = MockUploader::new();
    let collaborators = Collaborators {
        transport_factory: Arc::new(transport_factory),
        media_devices: devices.clone(),
        peer_factory: peer_factory.clone(),
        audio_router: router.clone(),
        recorder: recorder.clone(),
        uploader: uploader.clone(),
    };
    Harness {
        manager: CallManager::new(config, collaborators),
        signal_tx,
        transport,
        devices,
        peer_factory,
        router,
        recorder,
        uploader,
    }
}

/// Doctor "1" calling patient "2".
fn caller_params() -> SessionParams {
    SessionParams {
        local_user_id: "1".to_string(),
        remote_user_id: "2".to_string(),
        role: CallRole::Caller,
        role_label: "DOCTOR".to_string(),
    }
}

/// Patient "2" answering doctor "1".
fn callee_params() -> SessionParams {
    SessionParams {
        local_user_id: "2".to_string(),
        remote_user_id: "1".to_string(),
        role: CallRole::Callee,
        role_label: "PATIENT".to_string(),
    }
}

fn answer_from(from: &str, to: &str) -> SignalEnvelope {
    SignalEnvelope::Answer {
        answer: SessionDescription {
            kind: SdpType::Answer,
            sdp: "v=0 remote-answer".to_string(),
        },
        target: Some(to.to_string()),
        from: Some(from.to_string()),
    }
}

fn offer_from(from: &str, to: &str) -> SignalEnvelope {
    SignalEnvelope::Offer {
        offer: SessionDescription {
            kind: SdpType::Offer,
            sdp: "v=0 remote-offer".to_string(),
        },
        target: Some(to.to_string()),
        from: Some(from.to_string()),
    }
}

fn candidate_from(from: &str, to: &str) -> SignalEnvelope {
    SignalEnvelope::Candidate {
        candidate: IceCandidate::new("candidate:1 1 UDP 2130706431 10.0.0.1 9 typ host"),
        target: Some(to.to_string()),
        from: Some(from.to_string()),
    }
}

async fn next_event(handle: &mut CallSessionHandle) -> SessionEvent {
    timeout(Duration::from_secs(5), handle.events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("session event channel closed")
}

async fn wait_for_state(handle: &mut CallSessionHandle, name: &str) {
    loop {
        if let SessionEvent::StateChanged(state) = next_event(handle).await {
            if state.name() == name {
                return;
            }
        }
    }
}

async fn wait_for_ended(handle: &mut CallSessionHandle) -> EndReason {
    loop {
        if let SessionEvent::Ended { reason } = next_event(handle).await {
            return reason;
        }
    }
}

/// Injects a benign message and waits for its event, so everything injected
/// before it is known to be processed.
async fn drain(h: &Harness, handle: &mut CallSessionHandle, from: &str, to: &str) {
    h.signal_tx
        .send(TransportEvent::Message(SignalEnvelope::MuteStatus {
            from: from.to_string(),
            to: to.to_string(),
            is_muted: false,
        }))
        .await
        .unwrap();
    loop {
        if matches!(
            next_event(handle).await,
            SessionEvent::RemoteMuteChanged { .. }
        ) {
            return;
        }
    }
}

/// Drives a caller session all the way to `Connected`.
async fn connected_caller(h: &Harness) -> CallSessionHandle {
    let mut handle = h.manager.start_call(caller_params()).await.unwrap();
    wait_for_state(&mut handle, "Offering").await;
    h.signal_tx
        .send(TransportEvent::Message(answer_from("2", "1")))
        .await
        .unwrap();
    wait_for_state(&mut handle, "Negotiating").await;
    h.peer_factory
        .last_event_sender()
        .unwrap()
        .send(PeerEvent::RemoteTrack { track_count: 1 })
        .await
        .unwrap();
    wait_for_state(&mut handle, "Connected").await;
    handle
}

#[tokio::test]
async fn test_caller_sends_one_offer_and_connects() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;

    assert_eq!(h.transport.sent_count("join"), 1);
    assert_eq!(h.transport.sent_count("offer"), 1);
    // The caller never sends call_accepted or an answer.
    assert_eq!(h.transport.sent_count("call_accepted"), 0);
    assert_eq!(h.transport.sent_count("answer"), 0);

    // A duplicate answer is ignored: no second remote description, state
    // unchanged.
    h.signal_tx
        .send(TransportEvent::Message(answer_from("2", "1")))
        .await
        .unwrap();
    drain(&h, &mut handle, "2", "1").await;
    let pc = h.peer_factory.last_connection().unwrap();
    assert_eq!(pc.remote_descriptions().len(), 1);
}

#[tokio::test]
async fn test_callee_answers_the_offer() {
    let h = harness(CallConfig::default());
    let mut handle = h.manager.start_call(callee_params()).await.unwrap();
    wait_for_state(&mut handle, "Answering").await;

    h.signal_tx
        .send(TransportEvent::Message(offer_from("1", "2")))
        .await
        .unwrap();
    wait_for_state(&mut handle, "Negotiating").await;

    assert_eq!(h.transport.sent_count("join"), 1);
    assert_eq!(h.transport.sent_count("call_accepted"), 1);
    assert_eq!(h.transport.sent_count("answer"), 1);
    assert_eq!(h.transport.sent_count("offer"), 0);

    h.peer_factory
        .last_event_sender()
        .unwrap()
        .send(PeerEvent::RemoteTrack { track_count: 2 })
        .await
        .unwrap();
    wait_for_state(&mut handle, "Connected").await;

    // Canonical policy records on the caller side only.
    handle.commands.send(SessionCommand::EndCall).await.unwrap();
    wait_for_ended(&mut handle).await;
    assert_eq!(h.recorder.start_count(), 0);
    assert!(h.uploader.uploads().is_empty());
}

#[tokio::test]
async fn test_duplicate_candidates_are_tolerated() {
    let h = harness(CallConfig::default());
    let mut handle = h.manager.start_call(caller_params()).await.unwrap();
    wait_for_state(&mut handle, "Offering").await;

    for _ in 0..2 {
        h.signal_tx
            .send(TransportEvent::Message(candidate_from("2", "1")))
            .await
            .unwrap();
    }
    drain(&h, &mut handle, "2", "1").await;

    // Both applied, session still alive.
    let pc = h.peer_factory.last_connection().unwrap();
    assert_eq!(pc.candidates().len(), 2);
    assert_eq!(pc.close_count(), 0);
}

#[tokio::test]
async fn test_local_ice_candidates_are_signaled() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;

    h.peer_factory
        .last_event_sender()
        .unwrap()
        .send(PeerEvent::IceCandidate(IceCandidate::new("candidate:7")))
        .await
        .unwrap();
    drain(&h, &mut handle, "2", "1").await;

    let sent = h.transport.sent();
    let candidate = sent
        .iter()
        .find(|e| e.label() == "candidate")
        .expect("candidate was not signaled");
    assert_eq!(candidate.recipient(), Some("2"));
    assert_eq!(candidate.sender(), Some("1"));
}

#[tokio::test]
async fn test_local_hangup_tears_down_exactly_once() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;

    handle.commands.send(SessionCommand::EndCall).await.unwrap();
    // A racing second hangup must be absorbed.
    let _ = handle.commands.send(SessionCommand::EndCall).await;
    assert_eq!(wait_for_ended(&mut handle).await, EndReason::LocalHangup);

    assert_eq!(h.transport.sent_count("end_call"), 1);
    assert_eq!(h.transport.close_count(), 1);
    assert_eq!(h.peer_factory.last_connection().unwrap().close_count(), 1);
    for track in h.devices.tracks() {
        assert_eq!(track.stop_count(), 1);
    }
    assert_eq!(h.router.stop_count(), 1);

    let sent = h.transport.sent();
    let Some(SignalEnvelope::EndCall { to, ended_by, .. }) =
        sent.iter().find(|e| e.label() == "end_call")
    else {
        panic!("end_call was not sent");
    };
    assert_eq!(to, "2");
    assert_eq!(ended_by, "DOCTOR");
}

#[tokio::test]
async fn test_remote_end_call_is_not_echoed() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;

    h.signal_tx
        .send(TransportEvent::Message(SignalEnvelope::EndCall {
            from: "2".to_string(),
            to: "1".to_string(),
            ended_by: "PATIENT".to_string(),
        }))
        .await
        .unwrap();

    let mut saw_remote_ended = false;
    loop {
        match next_event(&mut handle).await {
            SessionEvent::RemoteEnded { ended_by } => {
                assert_eq!(ended_by, "PATIENT");
                saw_remote_ended = true;
            }
            SessionEvent::Ended { reason } => {
                assert_eq!(reason, EndReason::RemoteHangup);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_remote_ended);

    // Echoing end_call back would make the remote tear down twice.
    assert_eq!(h.transport.sent_count("end_call"), 0);
    assert_eq!(h.transport.close_count(), 1);
    assert_eq!(h.peer_factory.last_connection().unwrap().close_count(), 1);
}

#[tokio::test]
async fn test_caller_records_and_uploads() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;
    assert_eq!(h.recorder.start_count(), 1);
    assert_eq!(h.router.start_count(), 1);

    handle.commands.send(SessionCommand::EndCall).await.unwrap();
    wait_for_ended(&mut handle).await;

    assert_eq!(h.recorder.stop_count(), 1);
    let uploads = h.uploader.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].meta.caller_id, "1");
    assert_eq!(uploads[0].meta.receiver_id, "2");
    assert_eq!(uploads[0].meta.ended_by, "DOCTOR");
}

#[tokio::test]
async fn test_mute_toggle_is_signaled() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;

    handle
        .commands
        .send(SessionCommand::ToggleMute)
        .await
        .unwrap();
    loop {
        if let SessionEvent::LocalMuteChanged { muted } = next_event(&mut handle).await {
            assert!(muted);
            break;
        }
    }

    let sent = h.transport.sent();
    let Some(SignalEnvelope::MuteStatus { is_muted, to, .. }) =
        sent.iter().find(|e| e.label() == "mute_status")
    else {
        panic!("mute_status was not sent");
    };
    assert!(*is_muted);
    assert_eq!(to, "2");
}

#[tokio::test]
async fn test_unmute_handshake_accept() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;

    // Mute first, so the incoming request actually prompts.
    handle
        .commands
        .send(SessionCommand::ToggleMute)
        .await
        .unwrap();
    loop {
        if matches!(
            next_event(&mut handle).await,
            SessionEvent::LocalMuteChanged { muted: true }
        ) {
            break;
        }
    }

    h.signal_tx
        .send(TransportEvent::Message(SignalEnvelope::UnmuteRequest {
            from: "2".to_string(),
            to: "1".to_string(),
        }))
        .await
        .unwrap();
    loop {
        if matches!(next_event(&mut handle).await, SessionEvent::UnmuteRequested) {
            break;
        }
    }

    handle
        .commands
        .send(SessionCommand::RespondUnmute { accept: true })
        .await
        .unwrap();
    loop {
        if matches!(
            next_event(&mut handle).await,
            SessionEvent::LocalMuteChanged { muted: false }
        ) {
            break;
        }
    }

    let sent = h.transport.sent();
    assert!(sent.iter().any(|e| matches!(
        e,
        SignalEnvelope::UnmuteResponse { accepted: true, .. }
    )));
    // Accepting unmutes locally and broadcasts the new mute state.
    assert!(
        sent.iter()
            .any(|e| matches!(e, SignalEnvelope::MuteStatus { is_muted: false, .. }))
    );
}

#[tokio::test]
async fn test_unmute_handshake_decline_keeps_mute() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;

    handle
        .commands
        .send(SessionCommand::ToggleMute)
        .await
        .unwrap();
    loop {
        if matches!(
            next_event(&mut handle).await,
            SessionEvent::LocalMuteChanged { muted: true }
        ) {
            break;
        }
    }

    h.signal_tx
        .send(TransportEvent::Message(SignalEnvelope::UnmuteRequest {
            from: "2".to_string(),
            to: "1".to_string(),
        }))
        .await
        .unwrap();
    loop {
        if matches!(next_event(&mut handle).await, SessionEvent::UnmuteRequested) {
            break;
        }
    }

    handle
        .commands
        .send(SessionCommand::RespondUnmute { accept: false })
        .await
        .unwrap();

    // Declining must not touch the local mute state.
    h.signal_tx
        .send(TransportEvent::Message(SignalEnvelope::MuteStatus {
            from: "2".to_string(),
            to: "1".to_string(),
            is_muted: true,
        }))
        .await
        .unwrap();
    loop {
        match next_event(&mut handle).await {
            SessionEvent::RemoteMuteChanged { .. } => break,
            SessionEvent::LocalMuteChanged { .. } => {
                panic!("declining an unmute request changed the local mute state");
            }
            _ => {}
        }
    }

    let sent = h.transport.sent();
    assert!(sent.iter().any(|e| matches!(
        e,
        SignalEnvelope::UnmuteResponse {
            accepted: false,
            ..
        }
    )));
    // Only the mute_status from the earlier ToggleMute went out.
    assert_eq!(h.transport.sent_count("mute_status"), 1);
    assert!(
        sent.iter()
            .any(|e| matches!(e, SignalEnvelope::MuteStatus { is_muted: true, .. }))
    );
}

#[tokio::test]
async fn test_remote_self_unmute_settles_pending_request() {
    let config = CallConfig {
        unmute_timeout: Some(Duration::from_millis(50)),
        ..CallConfig::default()
    };
    let h = harness(config);
    let mut handle = connected_caller(&h).await;

    handle
        .commands
        .send(SessionCommand::RequestUnmute)
        .await
        .unwrap();
    // Wait until the request is on the wire, so the session has armed
    // `awaiting_unmute` before the remote's mute_status arrives.
    while h.transport.sent_count("unmute_request") == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    // The remote unmutes on their own instead of sending unmute_response.
    h.signal_tx
        .send(TransportEvent::Message(SignalEnvelope::MuteStatus {
            from: "2".to_string(),
            to: "1".to_string(),
            is_muted: false,
        }))
        .await
        .unwrap();
    loop {
        if let SessionEvent::UnmuteAnswered { accepted } = next_event(&mut handle).await {
            assert!(accepted);
            break;
        }
    }
    loop {
        if matches!(
            next_event(&mut handle).await,
            SessionEvent::RemoteMuteChanged { muted: false }
        ) {
            break;
        }
    }

    // The timer was disarmed: no late decline shows up.
    assert!(
        timeout(Duration::from_millis(200), handle.events.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_unmute_request_while_unmuted_is_auto_accepted() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;

    h.signal_tx
        .send(TransportEvent::Message(SignalEnvelope::UnmuteRequest {
            from: "2".to_string(),
            to: "1".to_string(),
        }))
        .await
        .unwrap();
    drain(&h, &mut handle, "2", "1").await;

    assert_eq!(h.transport.sent_count("unmute_response"), 1);
}

#[tokio::test]
async fn test_unanswered_unmute_request_reports_declined() {
    let config = CallConfig {
        unmute_timeout: Some(Duration::from_millis(50)),
        ..CallConfig::default()
    };
    let h = harness(config);
    let mut handle = connected_caller(&h).await;

    handle
        .commands
        .send(SessionCommand::RequestUnmute)
        .await
        .unwrap();
    loop {
        if let SessionEvent::UnmuteAnswered { accepted } = next_event(&mut handle).await {
            assert!(!accepted);
            break;
        }
    }
    assert_eq!(h.transport.sent_count("unmute_request"), 1);
}

#[tokio::test]
async fn test_media_failure_ends_the_call() {
    let h = harness(CallConfig::default());
    h.devices.fail.store(true, Ordering::Release);

    let mut handle = h.manager.start_call(caller_params()).await.unwrap();
    assert_eq!(wait_for_ended(&mut handle).await, EndReason::MediaFailure);

    // The remote side is told, and the socket is released.
    assert_eq!(h.transport.sent_count("end_call"), 1);
    assert_eq!(h.transport.close_count(), 1);
    assert!(h.uploader.uploads().is_empty());
}

#[tokio::test]
async fn test_transport_error_ends_abnormally() {
    let h = harness(CallConfig::default());
    let mut handle = h.manager.start_call(caller_params()).await.unwrap();
    wait_for_state(&mut handle, "Offering").await;

    h.signal_tx
        .send(TransportEvent::Error("connection reset".to_string()))
        .await
        .unwrap();
    assert_eq!(
        wait_for_ended(&mut handle).await,
        EndReason::SignalingFailure
    );
    assert_eq!(h.peer_factory.last_connection().unwrap().close_count(), 1);
    // The socket already failed; no farewell is attempted.
    assert_eq!(h.transport.sent_count("end_call"), 0);
}

#[tokio::test]
async fn test_connect_failure_ends_with_signaling_failure() {
    let _ = env_logger::builder().is_test(true).try_init();
    let devices = MockMediaDevices::new();
    let collaborators = Collaborators {
        transport_factory: Arc::new(MockTransportFactory::failing()),
        media_devices: devices.clone(),
        peer_factory: MockPeerFactory::new(),
        audio_router: MockAudioRouter::new(),
        recorder: MockRecorder::new(),
        uploader: MockUploader::new(),
    };
    let manager = CallManager::new(CallConfig::default(), collaborators);

    let mut handle = manager.start_call(caller_params()).await.unwrap();
    assert_eq!(
        wait_for_ended(&mut handle).await,
        EndReason::SignalingFailure
    );
    // The failure happened before any capture was requested.
    assert_eq!(devices.acquisition_count(), 0);
}

#[tokio::test]
async fn test_call_rejected_ends_with_rejected() {
    let h = harness(CallConfig::default());
    let mut handle = h.manager.start_call(caller_params()).await.unwrap();
    wait_for_state(&mut handle, "Offering").await;

    h.signal_tx
        .send(TransportEvent::Message(SignalEnvelope::CallRejected {
            from: "2".to_string(),
            to: "1".to_string(),
        }))
        .await
        .unwrap();
    assert_eq!(wait_for_ended(&mut handle).await, EndReason::Rejected);
}

#[tokio::test]
async fn test_messages_from_strangers_are_ignored() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;

    // end_call from a user who is not in this call.
    h.signal_tx
        .send(TransportEvent::Message(SignalEnvelope::EndCall {
            from: "999".to_string(),
            to: "1".to_string(),
            ended_by: "DOCTOR".to_string(),
        }))
        .await
        .unwrap();

    h.signal_tx
        .send(TransportEvent::Message(SignalEnvelope::MuteStatus {
            from: "2".to_string(),
            to: "1".to_string(),
            is_muted: true,
        }))
        .await
        .unwrap();
    loop {
        match next_event(&mut handle).await {
            SessionEvent::RemoteMuteChanged { muted } => {
                assert!(muted);
                break;
            }
            SessionEvent::RemoteEnded { .. } | SessionEvent::Ended { .. } => {
                panic!("stranger's end_call ended the session");
            }
            _ => {}
        }
    }
    assert_eq!(h.transport.close_count(), 0);
}

#[tokio::test]
async fn test_second_call_is_rejected_while_busy() {
    let h = harness(CallConfig::default());
    let mut handle = h.manager.start_call(caller_params()).await.unwrap();
    wait_for_state(&mut handle, "Offering").await;

    assert!(matches!(
        h.manager.start_call(callee_params()).await,
        Err(crate::error::CallError::Busy)
    ));

    // After the first call ends the line frees up again.
    handle.commands.send(SessionCommand::EndCall).await.unwrap();
    wait_for_ended(&mut handle).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match h.manager.start_call(callee_params()).await {
            Ok(_) => break,
            Err(crate::error::CallError::Busy) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

#[tokio::test]
async fn test_reject_call_without_a_session() {
    let h = harness(CallConfig::default());
    h.manager.reject_call(callee_params()).await.unwrap();

    assert_eq!(h.transport.sent_count("join"), 1);
    assert_eq!(h.transport.sent_count("call_rejected"), 1);
    assert_eq!(h.transport.close_count(), 1);
    // Declining never touches media or the recorder.
    assert_eq!(h.devices.acquisition_count(), 0);
    assert_eq!(h.recorder.start_count(), 0);
}

#[tokio::test]
async fn test_recording_disabled_by_policy() {
    let config = CallConfig {
        recording_policy: RecordingPolicy::Disabled,
        ..CallConfig::default()
    };
    let h = harness(config);
    let mut handle = connected_caller(&h).await;

    handle.commands.send(SessionCommand::EndCall).await.unwrap();
    wait_for_ended(&mut handle).await;

    assert_eq!(h.recorder.start_count(), 0);
    // Audio routing still ran for the call itself.
    assert_eq!(h.router.start_count(), 1);
    assert_eq!(h.router.stop_count(), 1);
}

#[tokio::test]
async fn test_camera_switch_round_trip() {
    let h = harness(CallConfig::default());
    let mut handle = connected_caller(&h).await;

    handle
        .commands
        .send(SessionCommand::SwitchCamera)
        .await
        .unwrap();
    loop {
        if let SessionEvent::CameraSwitched { front } = next_event(&mut handle).await {
            assert!(!front);
            break;
        }
    }
    assert_eq!(
        h.peer_factory.last_connection().unwrap().replacement_count(),
        1
    );
}
