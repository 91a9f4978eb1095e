use super::Packetizer;
use super::rtp::{RtpHeader, RtpPacket};

const DEFAULT_MTU: usize = 1400;

/// NAL unit types referenced by the server (H.264 Table 7-1, RFC 6184 §5.2).
pub mod nal_type {
    pub const IDR: u8 = 5;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
    pub const STAP_A: u8 = 24;
    pub const FU_A: u8 = 28;
}

/// Type field of a NAL unit header byte.
#[inline]
pub fn nal_unit_type(header: u8) -> u8 {
    header & 0x1f
}

/// Lazily walks an Annex B bitstream, yielding the NAL units between
/// start codes (both 4-byte `00 00 00 01` and 3-byte `00 00 01`).
///
/// A NAL unit runs from the byte after its start code to the byte before
/// the next start code, or to the end of the buffer. Bytes before the first
/// start code are ignored, as are empty units between adjacent start codes.
pub struct AnnexBUnits<'a> {
    data: &'a [u8],
    /// Index of the first byte of the next NAL, if a start code was found.
    next: Option<usize>,
}

impl<'a> AnnexBUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let next = find_start_code(data, 0).map(|(_, len_start)| len_start);
        Self { data, next }
    }
}

impl<'a> Iterator for AnnexBUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        loop {
            let start = self.next?;
            let (end, following) = match find_start_code(self.data, start) {
                Some((sc_pos, nal_start)) => (sc_pos, Some(nal_start)),
                None => (self.data.len(), None),
            };
            self.next = following;
            if start < end {
                return Some(&self.data[start..end]);
            }
        }
    }
}

/// Finds the next start code at or after `from`.
///
/// Returns `(start_code_position, first_nal_byte)`; a 4-byte start code is
/// reported at the position of its leading zero so the preceding NAL does
/// not keep it as a trailing byte.
pub(crate) fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                if i > from && data[i - 1] == 0 {
                    return Some((i - 1, i + 3));
                }
                return Some((i, i + 3));
            }
            if data[i + 2] == 0 {
                i += 1;
                continue;
            }
            i += 3;
            continue;
        }
        i += 1;
    }
    None
}

/// Convenience wrapper collecting [`AnnexBUnits`] into owned NAL units.
pub fn split_annex_b(data: &[u8]) -> Vec<Vec<u8>> {
    AnnexBUnits::new(data).map(<[u8]>::to_vec).collect()
}

/// Whether an RTP payload begins an access unit a decoder can start from:
/// an IDR slice, an SPS, or the first fragment of an IDR slice. STAP-A
/// aggregates are inspected for either type.
pub fn starts_keyframe(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };
    match nal_unit_type(first) {
        nal_type::IDR | nal_type::SPS => true,
        nal_type::FU_A => payload
            .get(1)
            .is_some_and(|fu| fu & 0x80 != 0 && nal_unit_type(*fu) == nal_type::IDR),
        nal_type::STAP_A => {
            let mut rest = &payload[1..];
            while rest.len() > 2 {
                let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                if size == 0 || rest.len() < 2 + size {
                    break;
                }
                if matches!(nal_unit_type(rest[2]), nal_type::IDR | nal_type::SPS) {
                    return true;
                }
                rest = &rest[2 + size..];
            }
            false
        }
        _ => false,
    }
}

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts access units (lists of NAL units without start codes) into
/// RTP packets. Supports two packetization modes from RFC 6184:
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the MTU are sent
///   as-is in a single RTP packet (12-byte header + NAL bytes).
///
/// - **FU-A Fragmentation** (§5.8): NALs exceeding the MTU are split
///   across multiple RTP packets. Each fragment carries a 2-byte FU
///   header (FU indicator + FU header) before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 2 bytes)
///   ```
///
/// ## Marker bit
///
/// Per RFC 6184 §5.1, the RTP marker bit is set on the last RTP packet
/// of an access unit.
///
/// Timestamps are left at zero; the pacing engine owns the timestamp line.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
}

impl H264Packetizer {
    /// Create with explicit payload type and SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            mtu: DEFAULT_MTU,
        }
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt),
            mtu: DEFAULT_MTU,
        }
    }

    /// Packetize a single NAL unit into one or more RTP packets.
    ///
    /// If the NAL fits within the MTU, it is sent as a Single NAL Unit
    /// packet (RFC 6184 §5.6). Otherwise, FU-A fragmentation is used
    /// (RFC 6184 §5.8).
    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool) -> Vec<RtpPacket> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.mtu {
            packets.push(self.header.packet(is_last_nal, nal_unit.to_vec()));
            return packets;
        }

        let nal_header = nal_unit[0];
        let nal_type = nal_unit_type(nal_header);
        let fu_indicator = (nal_header & 0x60) | nal_type::FU_A;
        let payload = &nal_unit[1..];

        let max_fragment = self.mtu - 2;
        let mut chunks = payload.chunks(max_fragment).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let last_fragment = chunks.peek().is_none();
            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last_fragment { 0x40 } else { 0x00 };

            let mut fragment = Vec::with_capacity(2 + chunk.len());
            fragment.push(fu_indicator);
            fragment.push(start_bit | end_bit | nal_type);
            fragment.extend_from_slice(chunk);
            packets.push(
                self.header
                    .packet(is_last_nal && last_fragment, fragment),
            );
            first = false;
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = packets.len(),
            "FU-A fragmented NAL unit"
        );

        packets
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, nal_units: &[Vec<u8>]) -> Vec<RtpPacket> {
        let mut packets = Vec::new();
        let count = nal_units.iter().filter(|n| !n.is_empty()).count();
        let mut seen = 0;

        for nal in nal_units.iter().filter(|n| !n.is_empty()) {
            seen += 1;
            packets.append(&mut self.packetize_nal(nal, seen == count));
        }

        tracing::trace!(
            nal_count = count,
            rtp_packets = packets.len(),
            seq = self.header.sequence(),
            "access unit packetized"
        );

        packets
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    /// 90 kHz clock rate per RFC 6184 §8.1.
    fn clock_rate(&self) -> u32 {
        90000
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }
}
