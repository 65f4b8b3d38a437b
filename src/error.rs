//! Call-related error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("signaling transport error: {0}")]
    Transport(String),

    #[error("media access denied or capture failed: {0}")]
    MediaAccess(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("recording failed: {0}")]
    Recording(String),

    #[error("recording upload failed: {0}")]
    Upload(String),

    #[error("another call is already active")]
    Busy,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] crate::state::InvalidTransition),
}

impl CallError {
    /// Fatal errors tear the session down; the rest are logged where they
    /// occur and the call keeps running.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Recording(_) | Self::Upload(_))
    }
}
