//! Session records and the thread-safe session registry.
//!
//! A [`SessionHandle`] is the shared record for one bridged stream: its
//! lifecycle state, allocated port pair, registered handlers, counters and
//! the shutdown signal its ingress pump listens on. The [`SessionRegistry`]
//! maps session ids to handles; create/lookup/remove may be called from any
//! task, and a lookup after a completed remove deterministically fails.

pub mod events;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::dispatch::{InputHandler, PortsHandler};
use crate::error::{Error, Result};
use crate::types::{PortPair, SessionId, SessionState};

/// Per-session counters. Packet-level failures land here instead of
/// propagating as errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Datagrams handed to the pump, valid or not.
    pub packets_received: u64,
    /// Packets delivered to the input handler.
    pub packets_relayed: u64,
    /// Structurally valid packets dropped by the relay core.
    pub packets_dropped: u64,
    /// Datagrams that failed minimal RTP framing validation.
    pub malformed_packets: u64,
    /// Inbound sequence numbers skipped over.
    pub sequence_gaps: u64,
    /// Frames produced while no input handler was registered.
    pub packets_unhandled: u64,
    /// Handler invocations that panicked.
    pub handler_panics: u64,
    /// Payload bytes delivered to the input handler.
    pub bytes_relayed: u64,
}

/// Point-in-time snapshot of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub state: SessionState,
    pub ports: Option<PortPair>,
    pub stats: SessionStats,
    pub created_at: Instant,
}

struct SessionInner {
    state: SessionState,
    ports: Option<PortPair>,
    ports_handler: Option<PortsHandlerSlot>,
    input_handler: Option<InputHandler>,
    stats: SessionStats,
}

// Handler trait objects have no Debug impl; show whether one is registered.
impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
            .field("state", &self.state)
            .field("ports", &self.ports)
            .field("ports_handler", &self.ports_handler)
            .field("input_handler_registered", &self.input_handler.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

/// A registered ports handler plus whether it has been invoked yet.
struct PortsHandlerSlot {
    handler: PortsHandler,
    dispatched: bool,
}

impl std::fmt::Debug for PortsHandlerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortsHandlerSlot")
            .field("dispatched", &self.dispatched)
            .finish()
    }
}

/// Shared record for one bridged session.
pub struct SessionHandle {
    id: SessionId,
    inner: RwLock<SessionInner>,
    shutdown_tx: watch::Sender<bool>,
    created_at: Instant,
}

impl SessionHandle {
    fn new(id: SessionId) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id,
            inner: RwLock::new(SessionInner {
                state: SessionState::Created,
                ports: None,
                ports_handler: None,
                input_handler: None,
                stats: SessionStats::default(),
            }),
            shutdown_tx,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn state(&self) -> SessionState {
        self.inner.read().await.state
    }

    pub async fn ports(&self) -> Option<PortPair> {
        self.inner.read().await.ports
    }

    pub async fn stats(&self) -> SessionStats {
        self.inner.read().await.stats.clone()
    }

    pub async fn info(&self) -> SessionInfo {
        let inner = self.inner.read().await;
        SessionInfo {
            session_id: self.id.clone(),
            state: inner.state,
            ports: inner.ports,
            stats: inner.stats.clone(),
            created_at: self.created_at,
        }
    }

    /// Record the allocated pair and move `Created -> PortsAssigned`.
    /// The pair is immutable from here on.
    pub(crate) async fn assign_ports(&self, pair: PortPair) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state != SessionState::Created {
            return Err(Error::InvalidState {
                operation: "assign_ports",
                state: inner.state,
            });
        }
        inner.ports = Some(pair);
        inner.state = SessionState::PortsAssigned;
        Ok(())
    }

    /// Register (or replace) the ports handler.
    ///
    /// Returns the port pair when it is already known and this registration
    /// has not been dispatched yet, in which case the caller must invoke
    /// the handler immediately (late-registration catch-up).
    pub(crate) async fn register_ports_handler(&self, handler: PortsHandler) -> Result<Option<PortPair>> {
        let mut inner = self.inner.write().await;
        if inner.state == SessionState::Closed {
            return Err(Error::session_closed(&self.id));
        }
        let catch_up = inner.ports;
        inner.ports_handler = Some(PortsHandlerSlot {
            handler,
            dispatched: catch_up.is_some(),
        });
        Ok(catch_up)
    }

    /// Register (or replace) the input handler. At most one registration
    /// per kind is live at a time.
    pub(crate) async fn register_input_handler(&self, handler: InputHandler) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state == SessionState::Closed {
            return Err(Error::session_closed(&self.id));
        }
        inner.input_handler = Some(handler);
        Ok(())
    }

    /// Take the ports handler for its one dispatch, marking it dispatched.
    /// Returns `None` when no handler is registered or it already fired.
    pub(crate) async fn ports_handler_for_dispatch(&self) -> Option<(PortsHandler, PortPair)> {
        let mut inner = self.inner.write().await;
        let ports = inner.ports?;
        let slot = inner.ports_handler.as_mut()?;
        if slot.dispatched {
            return None;
        }
        slot.dispatched = true;
        Some((slot.handler.clone(), ports))
    }

    /// Current input handler, cloned out so dispatch runs without the lock.
    pub(crate) async fn input_handler(&self) -> Option<InputHandler> {
        self.inner.read().await.input_handler.clone()
    }

    /// Move `PortsAssigned -> Active` on the first relayed packet.
    /// Returns true on the transition that actually happened.
    pub(crate) async fn mark_active(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.state == SessionState::PortsAssigned {
            inner.state = SessionState::Active;
            true
        } else {
            false
        }
    }

    /// Phase one of teardown: stop accepting packets. Returns false when
    /// teardown already started (idempotent stop).
    pub(crate) async fn begin_close(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.state.is_terminating() {
            return false;
        }
        inner.state = SessionState::Closing;
        true
    }

    /// Final teardown phase; `Closed` is terminal.
    pub(crate) async fn mark_closed(&self) {
        let mut inner = self.inner.write().await;
        inner.state = SessionState::Closed;
        inner.input_handler = None;
        inner.ports_handler = None;
    }

    /// Tell the ingress pump to stop.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown signal the pump selects on.
    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) async fn update_stats<F: FnOnce(&mut SessionStats)>(&self, f: F) {
        let mut inner = self.inner.write().await;
        f(&mut inner.stats);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

/// Thread-safe map of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new session in state `Created`.
    pub async fn create(&self) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(SessionId::new()));
        let mut sessions = self.sessions.write().await;
        sessions.insert(handle.id().clone(), handle.clone());
        debug!("Registered session {}", handle.id());
        handle
    }

    /// Look a session up; fails with [`Error::SessionNotFound`] after the
    /// session has been removed.
    pub async fn lookup(&self, id: &SessionId) -> Result<Arc<SessionHandle>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::session_not_found(id))
    }

    /// Remove a session from the map. Callers release ports and close the
    /// handle separately; once this returns, lookups fail.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(id);
        if removed.is_some() {
            debug!("Unregistered session {}", id);
        }
        removed
    }

    pub async fn ids(&self) -> Vec<SessionId> {
        let sessions = self.sessions.read().await;
        sessions.keys().cloned().collect()
    }
}
