//! Call lifecycle state machine.
//!
//! One `CallState` value per session, advanced exclusively through
//! [`apply_transition`](CallState::apply_transition). Inbound signaling that
//! would produce an invalid transition is ignored by the session layer (the
//! protocol tolerates duplicate and late messages); invalid local operations
//! surface the error.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which end of the call this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallRole {
    Caller,
    Callee,
}

impl CallRole {
    pub fn is_caller(self) -> bool {
        matches!(self, Self::Caller)
    }
}

/// Why a call reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// Local end request.
    LocalHangup,
    /// Remote party sent `end_call`.
    RemoteHangup,
    /// Remote party sent `call_rejected`.
    Rejected,
    /// Camera/microphone acquisition failed.
    MediaFailure,
    /// SDP or ICE application failed.
    NegotiationFailure,
    /// Transport error or unexpected close.
    SignalingFailure,
}

/// Current state of a call session.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum CallState {
    /// No call attempt yet.
    #[default]
    Idle,
    /// Transport connecting, `join` about to be sent.
    Joining,
    /// Caller: local media up, offer sent, waiting for the answer.
    Offering,
    /// Callee: local media up, waiting for the offer.
    Answering,
    /// Both descriptions applied, waiting for media to flow.
    Negotiating,
    /// Media flowing.
    Connected { connected_at: DateTime<Utc> },
    /// Teardown in progress.
    Ending {
        reason: EndReason,
        ended_by: Option<String>,
        connected_at: Option<DateTime<Utc>>,
    },
    /// Terminal. Further teardown requests are no-ops.
    Ended {
        reason: EndReason,
        ended_by: Option<String>,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Teardown has started or finished; no new work may begin.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::Ending { .. } | Self::Ended { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// States in which inbound ICE candidates apply.
    pub fn accepts_candidates(&self) -> bool {
        matches!(
            self,
            Self::Offering | Self::Answering | Self::Negotiating | Self::Connected { .. }
        )
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Connected { connected_at } => Some(*connected_at),
            Self::Ending { connected_at, .. } => *connected_at,
            _ => None,
        }
    }

    /// Short name for logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Joining => "Joining",
            Self::Offering => "Offering",
            Self::Answering => "Answering",
            Self::Negotiating => "Negotiating",
            Self::Connected { .. } => "Connected",
            Self::Ending { .. } => "Ending",
            Self::Ended { .. } => "Ended",
        }
    }

    /// Apply a state transition. Returns an error if the transition is not
    /// legal from the current state.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (&*self, transition) {
            (Self::Idle, CallTransition::Started) => Self::Joining,
            (Self::Joining, CallTransition::TransportOpened { role }) => {
                if role.is_caller() {
                    Self::Offering
                } else {
                    Self::Answering
                }
            }
            (Self::Answering, CallTransition::OfferApplied) => Self::Negotiating,
            (Self::Offering, CallTransition::AnswerApplied) => Self::Negotiating,
            (Self::Negotiating, CallTransition::RemoteMediaArrived) => Self::Connected {
                connected_at: Utc::now(),
            },
            (current, CallTransition::EndRequested { reason, ended_by })
                if !current.is_shutting_down() =>
            {
                Self::Ending {
                    reason,
                    ended_by,
                    connected_at: current.connected_at(),
                }
            }
            (
                Self::Ending {
                    reason,
                    ended_by,
                    connected_at,
                },
                CallTransition::TeardownComplete,
            ) => {
                let ended_at = Utc::now();
                Self::Ended {
                    reason: *reason,
                    ended_by: ended_by.clone(),
                    ended_at,
                    duration_secs: connected_at
                        .map(|start| ended_at.signed_duration_since(start).num_seconds()),
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name(),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        *self = new_state;
        Ok(())
    }
}

/// State transitions for call sessions.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Local start request; transport is being opened.
    Started,
    /// Signaling transport reported open.
    TransportOpened { role: CallRole },
    /// Callee applied the remote offer and sent its answer.
    OfferApplied,
    /// Caller applied the remote answer.
    AnswerApplied,
    /// First remote media track arrived.
    RemoteMediaArrived,
    /// Teardown requested (local, remote, or abnormal).
    EndRequested {
        reason: EndReason,
        ended_by: Option<String>,
    },
    /// All resources released.
    TeardownComplete,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: &'static str,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
