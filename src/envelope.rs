//! Wire messages exchanged over the signaling WebSocket.
//!
//! Every frame is a JSON object tagged by `type`. The set of types is closed:
//! unknown or malformed frames fail deserialization and are dropped with a
//! log line by the transport read pump, never surfaced to the state machine.
//!
//! Field names are camelCase on the wire (`userId`, `isMuted`, `endedBy`),
//! matching the signaling server. `offer`/`answer`/`candidate` carry `target`
//! when sent and `from` when received.

use serde::{Deserialize, Serialize};

/// A session description produced during offer/answer negotiation.
///
/// Standard WebRTC JSON shape: `{"type": "offer", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An ICE candidate as exchanged on the wire (RFC 5245 candidate string
/// plus SDP correlation fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// One signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEnvelope {
    #[serde(rename_all = "camelCase")]
    Join { user_id: String, role: String },

    CallAccepted {
        from: String,
        to: String,
    },

    CallRejected {
        from: String,
        to: String,
    },

    Offer {
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    Answer {
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    Candidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    EndCall {
        from: String,
        to: String,
        ended_by: String,
    },

    #[serde(rename_all = "camelCase")]
    MuteStatus {
        from: String,
        to: String,
        is_muted: bool,
    },

    UnmuteRequest {
        from: String,
        to: String,
    },

    UnmuteResponse {
        from: String,
        to: String,
        accepted: bool,
    },
}

impl SignalEnvelope {
    /// Wire tag, for logging.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::CallAccepted { .. } => "call_accepted",
            Self::CallRejected { .. } => "call_rejected",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::EndCall { .. } => "end_call",
            Self::MuteStatus { .. } => "mute_status",
            Self::UnmuteRequest { .. } => "unmute_request",
            Self::UnmuteResponse { .. } => "unmute_response",
        }
    }

    /// The user id this message came from, when the type carries one.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Self::Join { user_id, .. } => Some(user_id),
            Self::CallAccepted { from, .. }
            | Self::CallRejected { from, .. }
            | Self::EndCall { from, .. }
            | Self::MuteStatus { from, .. }
            | Self::UnmuteRequest { from, .. }
            | Self::UnmuteResponse { from, .. } => Some(from),
            Self::Offer { from, .. } | Self::Answer { from, .. } | Self::Candidate { from, .. } => {
                from.as_deref()
            }
        }
    }

    /// The user id this message is addressed to, when the type carries one.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::Join { .. } => None,
            Self::CallAccepted { to, .. }
            | Self::CallRejected { to, .. }
            | Self::EndCall { to, .. }
            | Self::MuteStatus { to, .. }
            | Self::UnmuteRequest { to, .. }
            | Self::UnmuteResponse { to, .. } => Some(to),
            Self::Offer { target, .. }
            | Self::Answer { target, .. }
            | Self::Candidate { target, .. } => target.as_deref(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        // Serialization of a closed enum over owned fields cannot fail.
        serde_json::to_string(self).expect("envelope serialization")
    }
}
