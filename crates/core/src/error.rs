//! Error types for the streaming server.

use std::fmt;

/// Errors that can occur anywhere in the server.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse), for malformed RTSP or SDP.
/// - **Transport**: [`Io`](Self::Io), [`Tls`](Self::Tls).
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound).
/// - **Stream**: [`StreamClosed`](Self::StreamClosed),
///   [`InvalidPacket`](Self::InvalidPacket).
/// - **Source**: [`TrackNotFound`](Self::TrackNotFound),
///   [`ParameterNotFound`](Self::ParameterNotFound),
///   [`TranscodeFailed`](Self::TranscodeFailed).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O, socket, file or pipe error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or record-layer failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The stream a packet was written to has been torn down.
    #[error("stream closed")]
    StreamClosed,

    /// An RTP packet could not be parsed.
    #[error("invalid RTP packet: {0}")]
    InvalidPacket(&'static str),

    /// The demuxer found no video track with a recognized codec.
    #[error("H.264 track not found")]
    TrackNotFound,

    /// No extraction strategy recovered both SPS and PPS.
    #[error("H.264 parameters not found: {0}")]
    ParameterNotFound(String),

    /// The external transcoder exited unsuccessfully.
    #[error("transcode failed ({status}): {output}")]
    TranscodeFailed { status: String, output: String },

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP message or SDP body.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

impl RtspError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        Self::Parse { kind }
    }
}

/// Specific kind of parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number or exceeded the message limit.
    InvalidContentLength,
    /// Request head or body was not valid UTF-8.
    InvalidEncoding,
    /// The request head grew past the message limit without terminating.
    MessageTooLarge,
    /// An SDP line was malformed.
    InvalidSdp(String),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::InvalidEncoding => write!(f, "invalid UTF-8"),
            Self::MessageTooLarge => write!(f, "message too large"),
            Self::InvalidSdp(line) => write!(f, "invalid SDP line: {line}"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
