//! Core identifier and state types shared across the bridge.

use std::fmt;

use uuid::Uuid;

/// Opaque identifier for one bridged media session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session identifier.
    pub fn new() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }

    /// Create a session identifier from an existing name (useful in tests
    /// and when the caller already has a correlation id).
    pub fn from_name(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The (video, audio) UDP port tuple allocated for a session.
///
/// Both ports are non-zero once assigned and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    /// Port the video RTP stream is received on.
    pub video: u16,
    /// Port the audio RTP stream is received on.
    pub audio: u16,
}

impl PortPair {
    /// Port carrying the given media kind.
    pub fn port(&self, kind: MediaKind) -> u16 {
        match kind {
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
        }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(video: {}, audio: {})", self.video, self.audio)
    }
}

/// Media type carried by a stream within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Lifecycle state of a bridged session.
///
/// Transitions are strictly forward:
/// `Created -> PortsAssigned -> Active -> Closing -> Closed`.
/// `Closed` is terminal; operations against a closed session fail with
/// [`crate::Error::SessionClosed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session exists but no ports are allocated yet.
    Created,
    /// Port pair allocated and announced; no packet relayed yet.
    PortsAssigned,
    /// At least one packet has been relayed.
    Active,
    /// Teardown started; no new packets are accepted.
    Closing,
    /// Teardown finished; terminal.
    Closed,
}

impl SessionState {
    /// Whether the session may still relay packets.
    pub fn can_relay(&self) -> bool {
        matches!(self, SessionState::PortsAssigned | SessionState::Active)
    }

    /// Whether teardown has started or finished.
    pub fn is_terminating(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "Created",
            SessionState::PortsAssigned => "PortsAssigned",
            SessionState::Active => "Active",
            SessionState::Closing => "Closing",
            SessionState::Closed => "Closed",
        };
        f.write_str(s)
    }
}
