//! Relay core: repackages inbound RTP into outbound RTC-transport frames.
//!
//! The transformation is deliberately minimal: the payload crosses the
//! bridge untouched, under a fresh outbound sequence number and a rebased
//! timestamp, so the RTC-side transport sees a self-consistent stream that
//! does not leak the legacy source's numbering. Sequence continuity of the
//! inbound stream is tracked; gaps are reported, never fatal. Each session
//! owns one `RelayCore` per direction, driven by a single task, so no
//! locking happens here.

use rand::Rng;

use crate::packet::{RtcFrame, RtpPacket};

/// Why a structurally valid packet was not relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Failed minimal RTP framing validation (undersized, bad version,
    /// truncated header). Counted by the ingress pump before the relay
    /// core is consulted.
    Malformed,
    /// Duplicate or reordered behind the newest delivered packet.
    Stale,
    /// Payload exceeds the configured maximum packet size.
    Oversized,
}

/// A sequence discontinuity observed on the inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// The sequence number that was expected next.
    pub expected: u16,
    /// The sequence number that actually arrived.
    pub got: u16,
}

impl SequenceGap {
    /// Number of inbound packets skipped over by this gap.
    pub fn skipped(&self) -> u64 {
        u64::from(self.got.wrapping_sub(self.expected))
    }
}

/// Result of feeding one packet through the relay core.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Packet was reframed; `gap` is set when inbound sequence numbers
    /// skipped ahead.
    Frame {
        frame: RtcFrame,
        gap: Option<SequenceGap>,
    },
    /// Packet was not relayed.
    Drop(DropReason),
}

/// Per-session, per-direction packetization state.
pub struct RelayCore {
    max_packet_size: usize,
    /// Newest inbound sequence number delivered, once the first packet
    /// has been seen.
    last_seq: Option<u16>,
    /// Inbound timestamp of the first relayed packet; outbound timestamps
    /// are rebased against it.
    ts_base: Option<u32>,
    /// Random outbound timestamp offset, RFC 3550 style.
    ts_offset: u32,
    /// Next outbound sequence number.
    out_seq: u16,
}

impl RelayCore {
    pub fn new(max_packet_size: usize) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            max_packet_size,
            last_seq: None,
            ts_base: None,
            ts_offset: rng.gen(),
            out_seq: rng.gen(),
        }
    }

    /// Feed one validated inbound packet through the relay.
    ///
    /// Ordering policy: packets are relayed in arrival order; a packet
    /// whose sequence number is at or behind the newest delivered one is
    /// dropped as stale (the RTC side has already moved past it), and a
    /// forward jump larger than one is relayed but reported as a gap.
    pub fn ingest(&mut self, packet: &RtpPacket) -> RelayOutcome {
        if packet.payload.len() > self.max_packet_size {
            return RelayOutcome::Drop(DropReason::Oversized);
        }

        let seq = packet.header.sequence_number;
        let mut gap = None;

        if let Some(last) = self.last_seq {
            let delta = seq.wrapping_sub(last);
            if delta == 0 || delta > u16::MAX / 2 {
                // Duplicate, or reordered behind the newest delivery.
                return RelayOutcome::Drop(DropReason::Stale);
            }
            if delta > 1 {
                gap = Some(SequenceGap {
                    expected: last.wrapping_add(1),
                    got: seq,
                });
            }
        }
        self.last_seq = Some(seq);

        let ts_base = *self.ts_base.get_or_insert(packet.header.timestamp);
        let timestamp = packet
            .header
            .timestamp
            .wrapping_sub(ts_base)
            .wrapping_add(self.ts_offset);

        self.out_seq = self.out_seq.wrapping_add(1);

        RelayOutcome::Frame {
            frame: RtcFrame {
                payload_type: packet.header.payload_type,
                marker: packet.header.marker,
                sequence_number: self.out_seq,
                timestamp,
                // Bytes clone is a refcount bump; the payload is never copied
                // or mutated on its way through.
                payload: packet.payload.clone(),
            },
            gap,
        }
    }
}
