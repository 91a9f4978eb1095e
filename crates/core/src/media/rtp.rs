use crate::error::{Result, RtspError};

/// Size of the RTP fixed header without CSRCs.
pub const RTP_HEADER_LEN: usize = 12;

/// An RTP packet (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Packets produced by the packetizer carry a zero timestamp; the pacing
/// engine assigns the final value before the packet reaches the sink.
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Serialize header and payload into wire format.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());
        out.push(2 << 6);
        out.push(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Borrowed view of a received RTP packet.
///
/// Used on the ingress path, where publisher packets are forwarded
/// verbatim and only inspected for bookkeeping (RTP-Info, keyframe gating).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpView<'a> {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: &'a [u8],
}

impl<'a> RtpView<'a> {
    /// Parse the fixed header, skipping CSRCs, a header extension and padding.
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        if raw.len() < RTP_HEADER_LEN {
            return Err(RtspError::InvalidPacket("shorter than fixed header"));
        }
        if raw[0] >> 6 != 2 {
            return Err(RtspError::InvalidPacket("version is not 2"));
        }
        let padding = raw[0] & 0x20 != 0;
        let extension = raw[0] & 0x10 != 0;
        let csrc_count = (raw[0] & 0x0f) as usize;

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if extension {
            if raw.len() < offset + 4 {
                return Err(RtspError::InvalidPacket("truncated header extension"));
            }
            let words = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }
        let mut end = raw.len();
        if padding {
            let pad = *raw.last().unwrap_or(&0) as usize;
            if pad == 0 || pad > end {
                return Err(RtspError::InvalidPacket("bad padding length"));
            }
            end -= pad;
        }
        if offset > end {
            return Err(RtspError::InvalidPacket("header exceeds packet"));
        }

        Ok(Self {
            marker: raw[1] & 0x80 != 0,
            payload_type: raw[1] & 0x7f,
            sequence: u16::from_be_bytes([raw[2], raw[3]]),
            timestamp: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ssrc: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            payload: &raw[offset..end],
        })
    }
}

/// Per-stream RTP header state shared by all packets a packetizer emits.
///
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet,
///   and never reset across source restarts.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 to avoid collisions.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
}

impl RtpHeader {
    /// Create a new RTP header state with explicit SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: 0,
        }
    }

    /// Create with a random SSRC and a random initial sequence number.
    pub fn with_random_ssrc(pt: u8) -> Self {
        let mut header = Self::new(pt, rand::random::<u32>());
        header.sequence = rand::random::<u16>();
        header
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Stamp a payload with the next sequence number.
    pub fn packet(&mut self, marker: bool, payload: Vec<u8>) -> RtpPacket {
        let packet = RtpPacket {
            marker,
            payload_type: self.pt,
            sequence: self.sequence,
            timestamp: 0,
            ssrc: self.ssrc,
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }
}
