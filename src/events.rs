//! Session events surfaced to the embedding UI layer.
//!
//! UI flags (mute icons, status line, prompts) are derived from these events
//! and the state snapshots they carry; the UI never mutates media directly.

use crate::state::{CallState, EndReason};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Lifecycle state changed.
    StateChanged(CallState),
    /// First remote media arrived; remote stream is ready to render.
    RemoteMediaArrived,
    LocalMuteChanged { muted: bool },
    LocalVideoChanged { enabled: bool },
    SpeakerChanged { speaker_on: bool },
    CameraSwitched { front: bool },
    /// Passive remote-mute display.
    RemoteMuteChanged { muted: bool },
    /// Remote party asks us to unmute; UI shows the consent prompt.
    UnmuteRequested,
    /// Remote party answered our unmute request.
    UnmuteAnswered { accepted: bool },
    /// Remote party ended the call. UI shows a blocking notice naming who
    /// before navigating away; local and abnormal ends navigate immediately.
    RemoteEnded { ended_by: String },
    /// Terminal: all resources released.
    Ended { reason: EndReason },
}
