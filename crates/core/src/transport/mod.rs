//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): carries RTSP signaling, plain or TLS. One thread
//!   per connection. Interleaved RTP (RFC 2326 §10.12) shares the same
//!   connection using `$` framing.
//!
//! - **UDP** ([`udp`]): one RTP and one RTCP socket shared by every
//!   unicast and multicast reader, also receiving UDP publishers' packets.

pub mod tcp;
pub mod udp;

pub use udp::{MulticastConfig, MulticastGroup, UdpTransport};
