//! Events emitted by the bridge.
//!
//! Events flow over an unbounded channel whose receiver the bridge owner
//! takes once. They are observability only: no component waits on them,
//! and a full or dropped receiver never blocks the data path.

use crate::relay::DropReason;
use crate::types::{PortPair, SessionId};

/// Events emitted by the bridge and its per-session pumps.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A session was created in the registry.
    SessionCreated { session_id: SessionId },
    /// A port pair was allocated and announced for a session.
    PortsAssigned {
        session_id: SessionId,
        ports: PortPair,
    },
    /// First packet relayed; the session is now active.
    SessionActive { session_id: SessionId },
    /// Teardown finished; the session is gone from the registry.
    SessionClosed { session_id: SessionId },
    /// One packet was relayed to the input handler.
    PacketRelayed { session_id: SessionId, bytes: usize },
    /// One packet was dropped before dispatch.
    PacketDropped {
        session_id: SessionId,
        reason: DropReason,
    },
    /// A gap in inbound sequence numbers was observed (reported, not fatal).
    SequenceGap {
        session_id: SessionId,
        expected: u16,
        got: u16,
    },
    /// A registered handler panicked during dispatch.
    HandlerPanicked { session_id: SessionId },
    /// The transport under a session's pump failed; the session closes.
    TransportFailed {
        session_id: SessionId,
        error: String,
    },
}
