//! The top-level bridge controller.
//!
//! Owns the port allocator, the session registry and the event channel,
//! and drives session lifecycle: create, handler registration, start
//! (allocate ports, announce them, spawn the ingress pump) and two-phase
//! teardown. One `RtpBridge` instance is one bridge; nothing here is
//! process-global.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::allocator::PortAllocator;
use crate::config::BridgeConfig;
use crate::dispatch::{self, InputHandler, PortsHandler};
use crate::error::{Error, Result};
use crate::ingress::{IngressPump, PacketSource};
use crate::relay::RelayCore;
use crate::session::events::BridgeEvent;
use crate::session::{SessionHandle, SessionInfo, SessionRegistry, SessionStats};
use crate::types::{MediaKind, PortPair, SessionId, SessionState};

type PumpMap = Arc<RwLock<HashMap<SessionId, JoinHandle<()>>>>;

/// Releases a session's resources once its pump has stopped accepting
/// packets. Shared with the ingress pump so a transport failure tears the
/// session down without waiting for an explicit stop.
pub(crate) struct SessionCleanup {
    allocator: Arc<PortAllocator>,
    registry: Arc<SessionRegistry>,
    pumps: PumpMap,
    event_tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl SessionCleanup {
    /// Release ports, close the handle and drop the registry entry.
    /// Every step is idempotent; a concurrent explicit stop and a
    /// transport-failure cleanup can overlap safely, and only whichever
    /// of them actually removed the registry entry reports the close.
    pub(crate) async fn run(&self, session: &Arc<SessionHandle>) {
        let id = session.id().clone();
        // The pump entry is dropped, not awaited: the pump itself runs
        // this during its own shutdown.
        self.pumps.write().await.remove(&id);
        self.allocator.release_session(&id).await;
        session.mark_closed().await;
        if self.registry.remove(&id).await.is_some() {
            info!("Closed session {}", id);
            let _ = self.event_tx.send(BridgeEvent::SessionClosed { session_id: id });
        }
    }
}

/// An RTP-to-RTC media bridge instance.
pub struct RtpBridge {
    config: BridgeConfig,
    allocator: Arc<PortAllocator>,
    registry: Arc<SessionRegistry>,
    /// Join handles of running ingress pumps, awaited during teardown.
    pumps: PumpMap,
    event_tx: mpsc::UnboundedSender<BridgeEvent>,
    /// Event receiver, taken once by the bridge owner.
    event_rx: RwLock<Option<mpsc::UnboundedReceiver<BridgeEvent>>>,
}

impl RtpBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let allocator = Arc::new(PortAllocator::new(config.allocator.clone()));
        Self {
            config,
            allocator,
            registry: Arc::new(SessionRegistry::new()),
            pumps: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: RwLock::new(Some(event_rx)),
        }
    }

    fn cleanup(&self) -> SessionCleanup {
        SessionCleanup {
            allocator: self.allocator.clone(),
            registry: self.registry.clone(),
            pumps: self.pumps.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    /// Create a new session in state `Created`.
    pub async fn create_session(&self) -> SessionId {
        let handle = self.registry.create().await;
        let session_id = handle.id().clone();
        info!("Created session {}", session_id);
        let _ = self.event_tx.send(BridgeEvent::SessionCreated {
            session_id: session_id.clone(),
        });
        session_id
    }

    /// Register (or replace) the ports handler for a session.
    ///
    /// When the port pair is already known the handler is invoked
    /// immediately with it (late-registration catch-up); otherwise it
    /// fires once when `start_session` allocates the pair.
    pub async fn register_ports_handler(&self, id: &SessionId, handler: PortsHandler) -> Result<()> {
        let session = self.registry.lookup(id).await?;
        if let Some(ports) = session.register_ports_handler(handler.clone()).await? {
            debug!("Late ports registration for session {}, catching up with {}", id, ports);
            if !dispatch::invoke_ports_handler(id, &handler, ports) {
                session.update_stats(|s| s.handler_panics += 1).await;
                let _ = self.event_tx.send(BridgeEvent::HandlerPanicked {
                    session_id: id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Register (or replace) the input handler for a session. Only the
    /// payload-carrying handler form exists; there is no zero-argument
    /// variant.
    pub async fn register_input_handler(&self, id: &SessionId, handler: InputHandler) -> Result<()> {
        let session = self.registry.lookup(id).await?;
        session.register_input_handler(handler).await
    }

    /// Start a session: allocate its port pair, announce it, then spawn
    /// the ingress pump over `source`.
    ///
    /// The ports dispatch completes before the pump exists, so it always
    /// happens before the first input dispatch of the session.
    pub async fn start_session(
        &self,
        id: &SessionId,
        source: Box<dyn PacketSource>,
    ) -> Result<PortPair> {
        let session = self.registry.lookup(id).await?;

        let state = session.state().await;
        if state == SessionState::Closed {
            return Err(Error::session_closed(id));
        }
        if state != SessionState::Created {
            return Err(Error::InvalidState {
                operation: "start_session",
                state,
            });
        }

        let ports = self.allocator.allocate_pair(id).await?;
        // A concurrent stop can close the session between the state check
        // and here; the freshly reserved pair must not leak.
        if let Err(e) = session.assign_ports(ports).await {
            self.allocator.release_session(id).await;
            return Err(e);
        }
        let _ = self.event_tx.send(BridgeEvent::PortsAssigned {
            session_id: id.clone(),
            ports,
        });

        if let Some((handler, ports)) = session.ports_handler_for_dispatch().await {
            if !dispatch::invoke_ports_handler(id, &handler, ports) {
                session.update_stats(|s| s.handler_panics += 1).await;
                let _ = self.event_tx.send(BridgeEvent::HandlerPanicked {
                    session_id: id.clone(),
                });
            }
        }

        let pump = IngressPump::new(
            session.clone(),
            RelayCore::new(self.config.pump.max_packet_size),
            source,
            self.config.pump.clone(),
            self.event_tx.clone(),
            self.cleanup(),
        );
        let handle = pump.spawn();
        self.pumps.write().await.insert(id.clone(), handle);

        // Teardown may have raced past the state check above; if the
        // session is gone, reap the pump (it exits on its own once it
        // sees the terminating state) instead of reporting a start.
        if self.registry.lookup(id).await.is_err() {
            session.signal_shutdown();
            if let Some(handle) = self.pumps.write().await.remove(id) {
                let _ = handle.await;
            }
            return Err(Error::session_closed(id));
        }

        info!("Started session {} on ports {}", id, ports);
        Ok(ports)
    }

    /// Tear a session down.
    ///
    /// Two-phase: mark `Closing` (no new packets accepted), signal and
    /// await the pump so any in-flight dispatch completes, release the
    /// port pair, then mark `Closed` and drop the registry entry.
    /// Idempotent: stopping an unknown or already-stopped session is a
    /// no-op.
    pub async fn stop_session(&self, id: &SessionId) -> Result<()> {
        let session = match self.registry.lookup(id).await {
            Ok(session) => session,
            Err(_) => return Ok(()),
        };

        if !session.begin_close().await {
            debug!("Stop requested for session {} that is already closing", id);
        }

        session.signal_shutdown();
        let pump = self.pumps.write().await.remove(id);
        if let Some(handle) = pump {
            if let Err(e) = handle.await {
                warn!("Ingress pump for session {} ended abnormally: {}", id, e);
            }
        }

        self.cleanup().run(&session).await;
        Ok(())
    }

    /// Snapshot of one session, or `None` after teardown.
    pub async fn session_info(&self, id: &SessionId) -> Option<SessionInfo> {
        let session = self.registry.lookup(id).await.ok()?;
        Some(session.info().await)
    }

    /// Counters for one session.
    pub async fn session_stats(&self, id: &SessionId) -> Option<SessionStats> {
        let session = self.registry.lookup(id).await.ok()?;
        Some(session.stats().await)
    }

    /// Ids of every live session.
    pub async fn sessions(&self) -> Vec<SessionId> {
        self.registry.ids().await
    }

    /// Port pair of a session, once assigned.
    pub async fn session_ports(&self, id: &SessionId) -> Option<PortPair> {
        let session = self.registry.lookup(id).await.ok()?;
        session.ports().await
    }

    /// Port a session receives the given media kind on, once assigned.
    pub async fn session_port(&self, id: &SessionId, kind: MediaKind) -> Option<u16> {
        let pair = self.allocator.pair_for(id).await?;
        Some(pair.port(kind))
    }

    /// Take the event receiver. Can only be taken once.
    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<BridgeEvent>> {
        self.event_rx.write().await.take()
    }
}

impl Default for RtpBridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

#[cfg(test)]
mod tests;
