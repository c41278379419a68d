//! Scenario tests for the bridge controller: lifecycle ordering, dispatch
//! ordering, teardown and failure containment.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::*;
use crate::config::{AllocatorConfig, PortRange, PumpConfig};
use crate::ingress::ChannelPacketSource;
use crate::packet::{RtpHeader, RtpPacket, RTP_VERSION};

/// What a test consumer observed, in observation order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Observed {
    Ports(u16, u16),
    Input { len: usize, tag: u8 },
}

type Log = Arc<Mutex<Vec<Observed>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn test_bridge() -> RtpBridge {
    init_tracing();
    RtpBridge::new(BridgeConfig {
        allocator: AllocatorConfig {
            port_range: PortRange::new(40_000, 40_100),
            bind_verify: false,
            ..AllocatorConfig::default()
        },
        pump: PumpConfig {
            recv_timeout: Duration::from_millis(50),
            ..PumpConfig::default()
        },
    })
}

fn ports_handler(log: &Log) -> PortsHandler {
    let log = log.clone();
    Arc::new(move |video, audio| {
        log.lock().unwrap().push(Observed::Ports(video, audio));
    })
}

fn input_handler(log: &Log) -> InputHandler {
    let log = log.clone();
    Arc::new(move |payload| {
        log.lock().unwrap().push(Observed::Input {
            len: payload.len(),
            tag: payload.first().copied().unwrap_or(0),
        });
    })
}

/// Build a valid RTP datagram of `total_len` bytes whose payload is
/// filled with `tag`.
fn rtp_datagram(seq: u16, total_len: usize, tag: u8) -> Bytes {
    assert!(total_len >= 12);
    RtpPacket {
        header: RtpHeader {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 96,
            sequence_number: seq,
            timestamp: u32::from(seq) * 160,
            ssrc: 0xC0FFEE,
        },
        payload: Bytes::from(vec![tag; total_len - 12]),
    }
    .serialize()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn ports_dispatch_precedes_first_input_dispatch() {
    let bridge = test_bridge();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let id = bridge.create_session().await;
    bridge.register_ports_handler(&id, ports_handler(&log)).await.unwrap();
    bridge.register_input_handler(&id, input_handler(&log)).await.unwrap();

    let (tx, source) = ChannelPacketSource::new();
    let ports = bridge.start_session(&id, Box::new(source)).await.unwrap();

    tx.send(rtp_datagram(1, 100, 1)).unwrap();
    tx.send(rtp_datagram(2, 100, 2)).unwrap();

    wait_until(|| log.lock().unwrap().len() == 3).await;
    let observed = log.lock().unwrap().clone();
    assert_eq!(
        observed,
        vec![
            Observed::Ports(ports.video, ports.audio),
            Observed::Input { len: 88, tag: 1 },
            Observed::Input { len: 88, tag: 2 },
        ]
    );

    bridge.stop_session(&id).await.unwrap();
}

#[tokio::test]
async fn packets_dispatch_in_order_and_malformed_are_dropped() {
    let bridge = test_bridge();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let id = bridge.create_session().await;
    bridge.register_input_handler(&id, input_handler(&log)).await.unwrap();

    let (tx, source) = ChannelPacketSource::new();
    bridge.start_session(&id, Box::new(source)).await.unwrap();

    // 172 bytes valid, 40 bytes of non-RTP noise, 200 bytes valid.
    tx.send(rtp_datagram(1, 172, 1)).unwrap();
    tx.send(Bytes::from(vec![0u8; 40])).unwrap();
    tx.send(rtp_datagram(2, 200, 3)).unwrap();

    wait_until(|| log.lock().unwrap().len() == 2).await;
    let observed = log.lock().unwrap().clone();
    assert_eq!(
        observed,
        vec![
            Observed::Input { len: 160, tag: 1 },
            Observed::Input { len: 188, tag: 3 },
        ]
    );

    let stats = bridge.session_stats(&id).await.unwrap();
    assert_eq!(stats.packets_received, 3);
    assert_eq!(stats.packets_relayed, 2);
    assert_eq!(stats.malformed_packets, 1);

    bridge.stop_session(&id).await.unwrap();
}

#[tokio::test]
async fn late_ports_registration_catches_up_immediately() {
    let bridge = test_bridge();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let id = bridge.create_session().await;
    let (_tx, source) = ChannelPacketSource::new();
    let ports = bridge.start_session(&id, Box::new(source)).await.unwrap();

    // No handler was registered when the ports were assigned; registration
    // after the fact must deliver the known pair synchronously.
    bridge.register_ports_handler(&id, ports_handler(&log)).await.unwrap();

    let observed = log.lock().unwrap().clone();
    assert_eq!(observed, vec![Observed::Ports(ports.video, ports.audio)]);

    bridge.stop_session(&id).await.unwrap();
}

#[tokio::test]
async fn concurrent_sessions_never_share_ports() {
    let bridge = Arc::new(test_bridge());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let bridge = bridge.clone();
        handles.push(tokio::spawn(async move {
            let id = bridge.create_session().await;
            let (_tx, source) = ChannelPacketSource::new();
            let ports = bridge.start_session(&id, Box::new(source)).await.unwrap();
            (id, ports)
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut sessions = Vec::new();
    for handle in handles {
        let (id, ports) = handle.await.unwrap();
        assert!(seen.insert(ports.video), "video port reused across sessions");
        assert!(seen.insert(ports.audio), "audio port reused across sessions");
        sessions.push((id, ports));
    }

    // Allocate-then-release round trip: a released pair becomes
    // assignable again.
    let (first_id, first_ports) = sessions.remove(0);
    bridge.stop_session(&first_id).await.unwrap();

    for _ in 0..8 {
        let id = bridge.create_session().await;
        let (_tx, source) = ChannelPacketSource::new();
        let ports = bridge.start_session(&id, Box::new(source)).await.unwrap();
        if ports == first_ports {
            return;
        }
    }
    panic!("released pair {first_ports} was never reallocated");
}

#[tokio::test]
async fn stop_session_is_terminal_and_idempotent() {
    let bridge = test_bridge();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let id = bridge.create_session().await;
    bridge.register_input_handler(&id, input_handler(&log)).await.unwrap();

    let (tx, source) = ChannelPacketSource::new();
    bridge.start_session(&id, Box::new(source)).await.unwrap();

    tx.send(rtp_datagram(1, 100, 1)).unwrap();
    wait_until(|| log.lock().unwrap().len() == 1).await;

    bridge.stop_session(&id).await.unwrap();

    // Lookup after destroy deterministically fails.
    assert!(bridge.session_info(&id).await.is_none());
    assert!(bridge.session_stats(&id).await.is_none());
    assert!(bridge.sessions().await.is_empty());

    // Packets sent after teardown are never delivered.
    let _ = tx.send(rtp_datagram(2, 100, 2));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(log.lock().unwrap().len(), 1);

    // Stopping again has no effect.
    bridge.stop_session(&id).await.unwrap();
}

#[tokio::test]
async fn panicking_input_handler_does_not_kill_the_pump() {
    let bridge = test_bridge();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let id = bridge.create_session().await;
    let inner_log = log.clone();
    bridge
        .register_input_handler(
            &id,
            Arc::new(move |payload: &[u8]| {
                if payload.first() == Some(&0xEE) {
                    panic!("consumer bug");
                }
                inner_log.lock().unwrap().push(Observed::Input {
                    len: payload.len(),
                    tag: payload.first().copied().unwrap_or(0),
                });
            }),
        )
        .await
        .unwrap();

    let (tx, source) = ChannelPacketSource::new();
    bridge.start_session(&id, Box::new(source)).await.unwrap();

    tx.send(rtp_datagram(1, 100, 0xEE)).unwrap();
    tx.send(rtp_datagram(2, 100, 7)).unwrap();

    wait_until(|| log.lock().unwrap().len() == 1).await;
    assert_eq!(
        log.lock().unwrap().clone(),
        vec![Observed::Input { len: 88, tag: 7 }]
    );

    let stats = bridge.session_stats(&id).await.unwrap();
    assert_eq!(stats.handler_panics, 1);
    assert_eq!(stats.packets_relayed, 1);

    bridge.stop_session(&id).await.unwrap();
}

#[tokio::test]
async fn missing_input_handler_loses_packets_silently() {
    let bridge = test_bridge();

    let id = bridge.create_session().await;
    let (tx, source) = ChannelPacketSource::new();
    bridge.start_session(&id, Box::new(source)).await.unwrap();

    tx.send(rtp_datagram(1, 100, 1)).unwrap();
    tx.send(rtp_datagram(2, 100, 2)).unwrap();

    let mut reached = false;
    for _ in 0..200 {
        if let Some(stats) = bridge.session_stats(&id).await {
            if stats.packets_unhandled == 2 {
                assert_eq!(stats.packets_relayed, 0);
                reached = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reached, "unhandled packets were never counted");

    bridge.stop_session(&id).await.unwrap();
}

#[tokio::test]
async fn session_becomes_active_after_first_relay() {
    let bridge = test_bridge();

    let id = bridge.create_session().await;
    let (tx, source) = ChannelPacketSource::new();
    bridge.start_session(&id, Box::new(source)).await.unwrap();

    let info = bridge.session_info(&id).await.unwrap();
    assert_eq!(info.state, SessionState::PortsAssigned);
    assert!(info.ports.is_some());

    tx.send(rtp_datagram(1, 100, 1)).unwrap();

    let mut reached = false;
    for _ in 0..200 {
        if let Some(info) = bridge.session_info(&id).await {
            if info.state == SessionState::Active {
                reached = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reached, "session never became active");

    bridge.stop_session(&id).await.unwrap();
}

#[tokio::test]
async fn starting_a_session_twice_fails() {
    let bridge = test_bridge();
    let id = bridge.create_session().await;

    let (_tx1, source1) = ChannelPacketSource::new();
    bridge.start_session(&id, Box::new(source1)).await.unwrap();

    let (_tx2, source2) = ChannelPacketSource::new();
    let err = bridge.start_session(&id, Box::new(source2)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    bridge.stop_session(&id).await.unwrap();
}

#[tokio::test]
async fn transport_failure_tears_the_session_down() {
    let bridge = test_bridge();
    let mut events = bridge.take_event_receiver().await.unwrap();

    let id = bridge.create_session().await;
    let (tx, source) = ChannelPacketSource::new();
    bridge.start_session(&id, Box::new(source)).await.unwrap();
    assert_eq!(bridge.allocator.allocated_count().await, 2);

    // Dropping every sender makes the channel source report EOF.
    drop(tx);

    let mut failed = false;
    let mut closed = false;
    while !(failed && closed) {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("session did not close after transport failure")
            .expect("event channel closed");
        match event {
            BridgeEvent::TransportFailed { session_id, .. } => {
                assert_eq!(session_id, id);
                failed = true;
            }
            BridgeEvent::SessionClosed { session_id } => {
                assert_eq!(session_id, id);
                closed = true;
            }
            _ => {}
        }
    }

    // The pump completed teardown on its own: ports released, registry
    // entry gone, no explicit stop required.
    assert!(bridge.session_info(&id).await.is_none());
    assert_eq!(bridge.allocator.allocated_count().await, 0);
    assert!(bridge.sessions().await.is_empty());

    // An explicit stop afterwards is still a clean no-op.
    bridge.stop_session(&id).await.unwrap();
}

#[tokio::test]
async fn racing_stop_against_start_never_leaks_ports() {
    let bridge = Arc::new(test_bridge());

    for _ in 0..50 {
        let id = bridge.create_session().await;
        let (_tx, source) = ChannelPacketSource::new();

        let starter = {
            let bridge = bridge.clone();
            let id = id.clone();
            tokio::spawn(async move { bridge.start_session(&id, Box::new(source)).await })
        };
        let stopper = {
            let bridge = bridge.clone();
            let id = id.clone();
            tokio::spawn(async move { bridge.stop_session(&id).await })
        };

        let _ = starter.await.unwrap();
        stopper.await.unwrap().unwrap();

        // Whatever the interleaving, a final stop must leave nothing
        // reserved for this session.
        bridge.stop_session(&id).await.unwrap();
        assert_eq!(
            bridge.allocator.pair_for(&id).await,
            None,
            "ports still reserved after stop"
        );
    }

    assert_eq!(bridge.allocator.allocated_count().await, 0);
}

#[tokio::test]
async fn session_port_reports_per_kind_ports() {
    let bridge = test_bridge();

    let id = bridge.create_session().await;
    let (_tx, source) = ChannelPacketSource::new();
    let ports = bridge.start_session(&id, Box::new(source)).await.unwrap();

    assert_eq!(bridge.session_port(&id, MediaKind::Video).await, Some(ports.video));
    assert_eq!(bridge.session_port(&id, MediaKind::Audio).await, Some(ports.audio));
    assert_eq!(bridge.session_ports(&id).await, Some(ports));

    bridge.stop_session(&id).await.unwrap();
    assert_eq!(bridge.session_port(&id, MediaKind::Video).await, None);
}
