//! Two-party call signaling and session state machine.
//!
//! This crate drives the client side of a video call: it speaks the JSON
//! signaling protocol over a WebSocket, owns the per-call lifecycle state
//! machine, controls the peer-connection and capture primitives through
//! trait seams, and coordinates the side effects of a call (audio routing,
//! recording, upload).
//!
//! Layering, from the wire up:
//!
//! - [`envelope`]: the signaling message vocabulary.
//! - [`transport`]: one WebSocket connection per call, surfaced as an event
//!   stream.
//! - [`peer`]: the one peer connection and local capture stream of a call.
//! - [`state`]: the lifecycle state machine; every session holds exactly one
//!   [`state::CallState`] and advances it through explicit transitions.
//! - [`effects`] and [`upload`]: recording, audio routing, and delivery of
//!   finished recordings.
//! - [`session`]: the single task that ties the above together;
//!   [`session::CallManager`] is the embedding entry point.

pub mod config;
pub mod effects;
pub mod envelope;
pub mod error;
pub mod events;
pub mod peer;
pub mod session;
pub mod state;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod protocol_tests;

pub use config::{CallConfig, RecordingPolicy};
pub use error::CallError;
pub use events::SessionEvent;
pub use session::{CallManager, CallSessionHandle, Collaborators, SessionCommand, SessionParams};
pub use state::{CallRole, CallState, EndReason};
