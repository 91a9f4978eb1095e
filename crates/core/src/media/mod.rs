//! Media codecs, RTP packetization and H.264 parameter extraction.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each access unit is split into one or more RTP packets. Every RTP
//! packet carries a 12-byte fixed header ([`rtp::RtpPacket`]) containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): 90 kHz media clock for H.264.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an access unit.
//!
//! MPEG transport streams and RTP share the 90 kHz clock for H.264, so
//! timestamps flow from the demuxer to the wire without rate conversion.

pub mod h264;
pub mod params;
pub mod rtp;

use rtp::RtpPacket;

/// Codec-specific RTP packetizer.
///
/// The generic RTP header is handled by [`rtp::RtpHeader`]: packetizers
/// compose it rather than reimplementing header serialization. Returned
/// packets carry a zero timestamp which the caller fills in.
pub trait Packetizer: Send {
    /// Packetize one access unit, given as NAL units without start codes.
    fn packetize(&mut self, nal_units: &[Vec<u8>]) -> Vec<RtpPacket>;

    /// Codec name for the SDP `a=rtpmap` attribute (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// RTP payload type number (RFC 3551). Dynamic types use 96–127.
    fn payload_type(&self) -> u8;

    /// Sequence number of the next emitted packet.
    fn next_sequence(&self) -> u16;
}
