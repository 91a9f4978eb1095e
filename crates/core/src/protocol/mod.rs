//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: framing the
//! byte stream, parsing requests, building responses, routing methods, and
//! generating and parsing SDP.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | ANNOUNCE | §10.3 | Publisher supplies its SDP |
//! | SETUP | §10.4 | Negotiate transport (UDP, TCP interleaved, multicast) |
//! | PLAY | §10.5 | Start media delivery |
//! | PAUSE | §10.6 | Suspend media delivery |
//! | RECORD | §10.11 | Publisher starts sending media |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER | §10.8 | Keepalive / parameter query |

pub mod handler;
pub mod message;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use message::{Message, MessageDecoder};
pub use request::RtspRequest;
pub use response::RtspResponse;
