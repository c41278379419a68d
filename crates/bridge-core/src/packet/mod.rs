//! Minimal RTP framing.
//!
//! The bridge only needs enough of RFC 3550 to validate inbound datagrams
//! and extract the payload: the 12-byte fixed header, CSRC list and the
//! optional extension header. Payloads are never mutated.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size of the fixed RTP header in bytes.
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// RTP protocol version the bridge accepts.
pub const RTP_VERSION: u8 = 2;

/// Parsed RTP fixed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse the fixed header from the start of `data`.
    ///
    /// Never trusts the externally supplied buffer: every field that
    /// extends the header (CSRC count, extension) is bounds-checked by
    /// [`RtpPacket::parse`] before the payload is sliced out.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_MIN_HEADER_SIZE {
            return Err(Error::malformed(format!(
                "datagram too short: {} bytes, need at least {}",
                data.len(),
                RTP_MIN_HEADER_SIZE
            )));
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(Error::malformed(format!(
                "unsupported RTP version {version}"
            )));
        }

        Ok(Self {
            version,
            padding: data[0] & 0x20 != 0,
            extension: data[0] & 0x10 != 0,
            csrc_count: data[0] & 0x0F,
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Byte offset of the payload, accounting for the CSRC list.
    /// The extension header, if present, follows this offset.
    pub fn csrc_end(&self) -> usize {
        RTP_MIN_HEADER_SIZE + self.csrc_count as usize * 4
    }
}

/// An inbound RTP packet: parsed header plus payload bytes.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parse a complete datagram into header and payload.
    pub fn parse(data: Bytes) -> Result<Self> {
        let header = RtpHeader::parse(&data)?;

        let mut offset = header.csrc_end();
        if data.len() < offset {
            return Err(Error::malformed(format!(
                "CSRC list truncated: {} bytes, header claims {}",
                data.len(),
                offset
            )));
        }

        if header.extension {
            // Extension header: 16-bit profile id, 16-bit length in words.
            if data.len() < offset + 4 {
                return Err(Error::malformed("extension header truncated"));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if data.len() < offset {
                return Err(Error::malformed(format!(
                    "extension data truncated: {} bytes, header claims {}",
                    data.len(),
                    offset
                )));
            }
        }

        let mut end = data.len();
        if header.padding {
            if end <= offset {
                return Err(Error::malformed("padded packet has no padding count"));
            }
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(Error::malformed(format!("invalid padding count {pad}")));
            }
            end -= pad;
        }

        Ok(Self {
            payload: data.slice(offset..end),
            header,
        })
    }

    /// Serialize back to wire format (fixed header only, no CSRC list or
    /// extension). Used by tests and by any return-path sender.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_MIN_HEADER_SIZE + self.payload.len());
        buf.put_u8((self.header.version << 6) | if self.header.extension { 0x10 } else { 0 });
        buf.put_u8((if self.header.marker { 0x80 } else { 0 }) | (self.header.payload_type & 0x7F));
        buf.put_u16(self.header.sequence_number);
        buf.put_u32(self.header.timestamp);
        buf.put_u32(self.header.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// An outbound frame for the RTC-side transport: the inbound payload,
/// untouched, under a fresh sequence number and rebased timestamp.
#[derive(Debug, Clone)]
pub struct RtcFrame {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_packet(seq: u16, payload_len: usize) -> Bytes {
        let packet = RtpPacket {
            header: RtpHeader {
                version: RTP_VERSION,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: true,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 160 * seq as u32,
                ssrc: 0xDEADBEEF,
            },
            payload: Bytes::from(vec![0xAB; payload_len]),
        };
        packet.serialize()
    }

    #[test]
    fn parses_valid_packet() {
        let data = valid_packet(7, 160);
        assert_eq!(data.len(), 172);

        let packet = RtpPacket::parse(data).unwrap();
        assert_eq!(packet.header.version, RTP_VERSION);
        assert_eq!(packet.header.payload_type, 96);
        assert_eq!(packet.header.sequence_number, 7);
        assert_eq!(packet.header.timestamp, 1120);
        assert_eq!(packet.header.ssrc, 0xDEADBEEF);
        assert!(packet.header.marker);
        assert_eq!(packet.payload.len(), 160);
    }

    #[test]
    fn rejects_short_datagram() {
        let err = RtpHeader::parse(&[0x80; 11]).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket { .. }));
    }

    #[test]
    fn rejects_wrong_version() {
        // Version bits 0b00 in the first byte.
        let mut data = valid_packet(1, 28).to_vec();
        data[0] = 0x00;
        let err = RtpPacket::parse(Bytes::from(data)).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket { .. }));
    }

    #[test]
    fn rejects_truncated_csrc_list() {
        let mut data = valid_packet(1, 0).to_vec();
        data[0] |= 0x04; // claim 4 CSRC entries that are not there
        let err = RtpPacket::parse(Bytes::from(data)).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket { .. }));
    }

    #[test]
    fn strips_padding() {
        let mut data = valid_packet(1, 8).to_vec();
        data[0] |= 0x20; // padding flag
        data.extend_from_slice(&[0, 0, 0, 4]); // 4 bytes of padding
        let packet = RtpPacket::parse(Bytes::from(data)).unwrap();
        assert_eq!(packet.payload.len(), 8);
    }
}
