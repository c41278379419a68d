//! Error handling for the bridge.
//!
//! Allocation and registry errors surface synchronously to the caller that
//! starts or stops a session. Packet-level failures (malformed datagrams,
//! panicking handlers) are absorbed locally by the ingress pump, counted in
//! the session statistics and never tear a session down.

use thiserror::Error;

use crate::types::{SessionId, SessionState};

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bridge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No free port pair is left in the configured range.
    #[error("No free port pair available in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    /// The session id is unknown to the registry.
    #[error("Session not found: {id}")]
    SessionNotFound { id: SessionId },

    /// The session has been torn down; the operation can never succeed.
    #[error("Session {id} is closed")]
    SessionClosed { id: SessionId },

    /// A datagram failed minimal RTP framing validation.
    #[error("Malformed packet: {details}")]
    MalformedPacket { details: String },

    /// The session is not in a state that permits the operation.
    #[error("Invalid session state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// Underlying transport failure (socket closed, bind refused, ...).
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl Error {
    pub fn session_not_found(id: &SessionId) -> Self {
        Error::SessionNotFound { id: id.clone() }
    }

    pub fn session_closed(id: &SessionId) -> Self {
        Error::SessionClosed { id: id.clone() }
    }

    pub fn malformed(details: impl Into<String>) -> Self {
        Error::MalformedPacket {
            details: details.into(),
        }
    }
}
