//! Packet ingress: the per-session receive loop.
//!
//! Each session runs one pump task over a [`PacketSource`]. The pump
//! validates minimal RTP framing, feeds valid packets through the relay
//! core in arrival order and dispatches the resulting frames to the
//! registered input handler, still in order and still on this task.
//! Because every session has its own task, a slow or stalled consumer
//! only ever holds up its own session.
//!
//! Receive waits are bounded so teardown can interrupt a quiet pump; a
//! persistent transport failure is the one non-explicit way a session
//! ends.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::bridge::SessionCleanup;
use crate::config::PumpConfig;
use crate::dispatch;
use crate::packet::RtpPacket;
use crate::relay::{DropReason, RelayCore, RelayOutcome};
use crate::session::events::BridgeEvent;
use crate::session::SessionHandle;

/// Network receive primitive: yields one datagram per call.
///
/// The bridge consumes its transport through this seam only; the real
/// ICE/DTLS/SRTP stack stays outside. [`UdpPacketSource`] is the
/// production implementation, [`ChannelPacketSource`] feeds tests.
#[async_trait]
pub trait PacketSource: Send {
    /// Receive the next datagram. An error is treated as transport
    /// failure and closes the session.
    async fn recv(&mut self) -> io::Result<Bytes>;
}

/// Largest payload a UDP datagram can carry. The default receive buffer
/// is this big so no datagram is truncated before validation; oversize
/// policy belongs to the relay core, not the socket.
const MAX_UDP_PAYLOAD: usize = 65_535;

/// Datagram source over a bound UDP socket.
pub struct UdpPacketSource {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpPacketSource {
    /// Bind a socket for receiving. Typically bound to one port of a
    /// session's allocated pair.
    pub async fn bind(addr: std::net::SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket))
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self::with_capacity(socket, MAX_UDP_PAYLOAD)
    }

    /// Source with an explicit receive buffer size, for callers that want
    /// to bound it to their configured maximum packet size.
    pub fn with_capacity(socket: UdpSocket, capacity: usize) -> Self {
        Self {
            socket,
            buf: vec![0u8; capacity],
        }
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl PacketSource for UdpPacketSource {
    async fn recv(&mut self) -> io::Result<Bytes> {
        let (len, _from) = self.socket.recv_from(&mut self.buf).await?;
        Ok(Bytes::copy_from_slice(&self.buf[..len]))
    }
}

/// Channel-backed source for tests and in-process producers. The source
/// reports transport failure once every sender is dropped.
pub struct ChannelPacketSource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ChannelPacketSource {
    pub fn new() -> (mpsc::UnboundedSender<Bytes>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl PacketSource for ChannelPacketSource {
    async fn recv(&mut self) -> io::Result<Bytes> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "packet source closed"))
    }
}

/// The per-session receive loop.
pub struct IngressPump {
    session: Arc<SessionHandle>,
    relay: RelayCore,
    source: Box<dyn PacketSource>,
    config: PumpConfig,
    event_tx: mpsc::UnboundedSender<BridgeEvent>,
    cleanup: SessionCleanup,
}

impl IngressPump {
    pub(crate) fn new(
        session: Arc<SessionHandle>,
        relay: RelayCore,
        source: Box<dyn PacketSource>,
        config: PumpConfig,
        event_tx: mpsc::UnboundedSender<BridgeEvent>,
        cleanup: SessionCleanup,
    ) -> Self {
        Self {
            session,
            relay,
            source,
            config,
            event_tx,
            cleanup,
        }
    }

    /// Spawn the pump onto its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let session_id = self.session.id().clone();
        let mut shutdown = self.session.subscribe_shutdown();
        debug!("Ingress pump started for session {}", session_id);

        loop {
            tokio::select! {
                // Teardown wins over a pending receive.
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                received = timeout(self.config.recv_timeout, self.source.recv()) => {
                    match received {
                        // Bounded wait elapsed; loop around and re-check shutdown.
                        Err(_elapsed) => {
                            if self.session.state().await.is_terminating() {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("Transport failed for session {}: {}", session_id, e);
                            // The only non-explicit teardown path: the pump
                            // itself closes the session and frees its ports.
                            self.session.begin_close().await;
                            let _ = self.event_tx.send(BridgeEvent::TransportFailed {
                                session_id: session_id.clone(),
                                error: e.to_string(),
                            });
                            self.cleanup.run(&self.session).await;
                            break;
                        }
                        Ok(Ok(datagram)) => {
                            self.handle_datagram(datagram).await;
                        }
                    }
                }
            }
        }

        debug!("Ingress pump stopped for session {}", session_id);
    }

    /// Validate, relay and dispatch one datagram. Packet-level failures
    /// are counted and absorbed; nothing here tears the session down.
    async fn handle_datagram(&mut self, datagram: Bytes) {
        let session_id = self.session.id().clone();
        self.session.update_stats(|s| s.packets_received += 1).await;

        if !self.session.state().await.can_relay() {
            // Closing or closed: no new packets are accepted.
            return;
        }

        let packet = match RtpPacket::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed packet for session {}: {}", session_id, e);
                self.session.update_stats(|s| s.malformed_packets += 1).await;
                let _ = self.event_tx.send(BridgeEvent::PacketDropped {
                    session_id,
                    reason: DropReason::Malformed,
                });
                return;
            }
        };

        let (frame, gap) = match self.relay.ingest(&packet) {
            RelayOutcome::Frame { frame, gap } => (frame, gap),
            RelayOutcome::Drop(reason) => {
                debug!("Relay dropped packet for session {}: {:?}", session_id, reason);
                self.session.update_stats(|s| s.packets_dropped += 1).await;
                let _ = self.event_tx.send(BridgeEvent::PacketDropped { session_id, reason });
                return;
            }
        };

        if let Some(gap) = gap {
            self.session
                .update_stats(|s| s.sequence_gaps += gap.skipped())
                .await;
            let _ = self.event_tx.send(BridgeEvent::SequenceGap {
                session_id: session_id.clone(),
                expected: gap.expected,
                got: gap.got,
            });
        }

        // A frame was produced; the session is active from
        // the first one even if no consumer is listening yet.
        if self.session.mark_active().await {
            let _ = self.event_tx.send(BridgeEvent::SessionActive {
                session_id: session_id.clone(),
            });
        }

        match self.session.input_handler().await {
            None => {
                // Legacy behavior: packets are lost silently when no input
                // handler is registered. Kept observable via the counter.
                self.session.update_stats(|s| s.packets_unhandled += 1).await;
            }
            Some(handler) => {
                // The frame's buffer is borrowed for this call only.
                if dispatch::invoke_input_handler(&session_id, &handler, &frame.payload) {
                    let bytes = frame.payload.len();
                    self.session.update_stats(|s| {
                        s.packets_relayed += 1;
                        s.bytes_relayed += bytes as u64;
                    })
                    .await;
                    let _ = self.event_tx.send(BridgeEvent::PacketRelayed { session_id, bytes });
                } else {
                    self.session.update_stats(|s| s.handler_panics += 1).await;
                    let _ = self.event_tx.send(BridgeEvent::HandlerPanicked { session_id });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_source_yields_datagrams() {
        let mut source = UdpPacketSource::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let dest = source.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"hello bridge", dest).await.unwrap();

        let datagram = source.recv().await.unwrap();
        assert_eq!(&datagram[..], b"hello bridge");
    }

    #[tokio::test]
    async fn udp_source_receives_datagrams_larger_than_legacy_mtu() {
        let mut source = UdpPacketSource::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let dest = source.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let datagram = vec![0x42u8; 4000];
        sender.send_to(&datagram, dest).await.unwrap();

        let received = source.recv().await.unwrap();
        assert_eq!(received.len(), 4000);
        assert_eq!(&received[..], &datagram[..]);
    }

    #[tokio::test]
    async fn channel_source_reports_eof_when_senders_drop() {
        let (tx, mut source) = ChannelPacketSource::new();
        tx.send(Bytes::from_static(b"one")).unwrap();
        drop(tx);

        assert_eq!(&source.recv().await.unwrap()[..], b"one");
        let err = source.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
