//! Framing of the RTSP byte stream.
//!
//! One TCP connection carries both text requests and, once a session uses
//! interleaved transport, binary `$` frames (RFC 2326 §10.12):
//!
//! ```text
//! '$' | channel (1 byte) | length (2 bytes, big-endian) | data
//! ```
//!
//! [`MessageDecoder`] buffers raw reads and yields whole messages of
//! either kind.

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::RtspRequest;

/// Upper bound on a request head (request line plus headers).
pub const MAX_HEAD_LEN: usize = 64 * 1024;
/// Upper bound on a request body.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

#[derive(Debug)]
pub enum Message {
    Request(RtspRequest),
    Interleaved { channel: u8, payload: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Next complete message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let skip = self
            .buf
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        self.buf.drain(..skip);

        match self.buf.first() {
            None => Ok(None),
            Some(b'$') => Ok(self.next_interleaved()),
            Some(_) => self.next_request(),
        }
    }

    fn next_interleaved(&mut self) -> Option<Message> {
        if self.buf.len() < 4 {
            return None;
        }
        let channel = self.buf[1];
        let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        if self.buf.len() < 4 + len {
            return None;
        }
        let payload = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Some(Message::Interleaved { channel, payload })
    }

    fn next_request(&mut self) -> Result<Option<Message>> {
        let Some(head_end) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            if self.buf.len() > MAX_HEAD_LEN {
                return Err(RtspError::parse(ParseErrorKind::MessageTooLarge));
            }
            return Ok(None);
        };
        if head_end > MAX_HEAD_LEN {
            return Err(RtspError::parse(ParseErrorKind::MessageTooLarge));
        }

        let head = std::str::from_utf8(&self.buf[..head_end])
            .map_err(|_| RtspError::parse(ParseErrorKind::InvalidEncoding))?;
        let content_length = content_length(head)?;
        let total = head_end + 4 + content_length;
        if self.buf.len() < total {
            return Ok(None);
        }

        let message: Vec<u8> = self.buf.drain(..total).collect();
        let text = String::from_utf8(message)
            .map_err(|_| RtspError::parse(ParseErrorKind::InvalidEncoding))?;
        RtspRequest::parse(&text).map(|req| Some(Message::Request(req)))
    }
}

fn content_length(head: &str) -> Result<usize> {
    let Some(value) = head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("Content-Length")
            .then_some(value.trim())
    }) else {
        return Ok(0);
    };
    match value.parse::<usize>() {
        Ok(len) if len <= MAX_BODY_LEN => Ok(len),
        _ => Err(RtspError::parse(ParseErrorKind::InvalidContentLength)),
    }
}
