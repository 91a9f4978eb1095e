//! Picture-delimited pipe reader.
//!
//! A capture process writes back-to-back JPEG pictures into a named pipe
//! with no container framing. Pictures are cut at `FF D8` / `FF D9` and each
//! becomes a single-unit access unit timed by a frame counter.

use std::io::{self, Read};
use std::thread;
use std::time::Duration;

use super::{AccessUnit, SourceEvent};
use crate::error::Result;

const START_MARKER: [u8; 2] = [0xff, 0xd8];
const END_MARKER: [u8; 2] = [0xff, 0xd9];
const READ_CHUNK: usize = 4096;
/// Bytes retained when no start marker is buffered.
const TAIL_KEEP: usize = 10;
/// Pictures shorter than this are treated as noise.
const MIN_PICTURE_LEN: usize = 10;
const EOF_BACKOFF: Duration = Duration::from_millis(100);

pub const DEFAULT_BUFFER_CAP: usize = 2 * 1024 * 1024;

pub struct PictureReader<R> {
    reader: R,
    buf: Vec<u8>,
    cap: usize,
    frames: u64,
    ticks_per_frame: i64,
}

impl<R: Read> PictureReader<R> {
    /// `cap` bounds the internal buffer; it must be at least one read chunk.
    pub fn new(reader: R, nominal_fps: u32, cap: usize) -> Self {
        let fps = nominal_fps.max(1);
        Self {
            reader,
            buf: Vec::with_capacity(READ_CHUNK * 4),
            cap: cap.max(READ_CHUNK),
            frames: 0,
            ticks_per_frame: (90_000 / fps) as i64,
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Block until a complete picture is available.
    ///
    /// End of file is not terminal: the writer side of a pipe may reopen,
    /// so the reader backs off and keeps polling.
    pub fn next_event(&mut self) -> Result<SourceEvent> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(picture) = self.take_picture() {
                let ts = self.frames as i64 * self.ticks_per_frame;
                self.frames += 1;
                if self.frames % 300 == 0 {
                    tracing::debug!(frames = self.frames, bytes = picture.len(), "pipe pictures read");
                }
                return Ok(SourceEvent::AccessUnit(AccessUnit {
                    pts: ts,
                    dts: ts,
                    nalus: vec![picture],
                }));
            }

            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    tracing::trace!("pipe at end of file, waiting for writer");
                    thread::sleep(EOF_BACKOFF);
                }
                Ok(n) => self.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.cap {
            let drop = (self.buf.len() / 2).max(self.buf.len() - self.cap);
            tracing::warn!(dropped = drop, cap = self.cap, "picture buffer full, discarding oldest bytes");
            self.buf.drain(..drop);
        }
    }

    fn take_picture(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(start) = find(&self.buf, &START_MARKER, 0) else {
                if self.buf.len() > TAIL_KEEP {
                    self.buf.drain(..self.buf.len() - TAIL_KEEP);
                }
                return None;
            };
            self.buf.drain(..start);

            let end = find(&self.buf, &END_MARKER, START_MARKER.len())? + END_MARKER.len();
            let picture: Vec<u8> = self.buf.drain(..end).collect();
            if picture.len() < MIN_PICTURE_LEN {
                tracing::debug!(len = picture.len(), "skipping undersized picture");
                continue;
            }
            return Some(picture);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Yields queued chunks, then returns an error so tests never block on
    /// the end-of-file backoff.
    struct Chunks(VecDeque<Vec<u8>>);

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(mut chunk) = self.0.pop_front() else {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "drained"));
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.0.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    fn picture(fill: u8, len: usize) -> Vec<u8> {
        let mut out = START_MARKER.to_vec();
        out.extend(std::iter::repeat_n(fill, len));
        out.extend_from_slice(&END_MARKER);
        out
    }

    fn unit(event: SourceEvent) -> AccessUnit {
        match event {
            SourceEvent::AccessUnit(unit) => unit,
            SourceEvent::Restart => panic!("pipe reader never restarts"),
        }
    }

    #[test]
    fn splits_pictures_across_chunks() {
        let mut stream = vec![0x00, 0x11];
        stream.extend(picture(0xaa, 40));
        stream.extend(picture(0xbb, 5000));
        let chunks = stream.chunks(7).map(<[u8]>::to_vec).collect();
        let mut reader = PictureReader::new(Chunks(chunks), 30, DEFAULT_BUFFER_CAP);

        let first = unit(reader.next_event().unwrap());
        assert_eq!(first.nalus, vec![picture(0xaa, 40)]);
        assert_eq!(first.pts, 0);
        let second = unit(reader.next_event().unwrap());
        assert_eq!(second.nalus[0].len(), 5004);
        assert_eq!(second.dts, 3000);
        assert!(reader.next_event().is_err());
    }

    #[test]
    fn skips_undersized_pictures() {
        let mut stream = picture(0x01, 2);
        stream.extend(picture(0x02, 20));
        let mut reader = PictureReader::new(Chunks(VecDeque::from([stream])), 25, DEFAULT_BUFFER_CAP);
        let only = unit(reader.next_event().unwrap());
        assert_eq!(only.nalus[0], picture(0x02, 20));
        assert_eq!(reader.frames(), 1);
    }

    #[test]
    fn keeps_only_tail_without_start_marker() {
        let mut reader = PictureReader::new(Chunks(VecDeque::from([vec![0x12; 1000]])), 30, DEFAULT_BUFFER_CAP);
        assert!(reader.next_event().is_err());
        assert_eq!(reader.buffered_len(), TAIL_KEEP);
    }

    #[test]
    fn buffer_never_exceeds_cap() {
        let cap = 64 * 1024;
        // A start marker followed by an endless picture body.
        let mut chunks = VecDeque::from([START_MARKER.to_vec()]);
        chunks.extend(std::iter::repeat_n(vec![0x42; READ_CHUNK], 200));
        let mut reader = PictureReader::new(Chunks(chunks), 30, cap);
        assert!(reader.next_event().is_err());
        assert!(reader.buffered_len() <= cap);
    }

    #[test]
    fn buffer_cap_holds_after_every_push() {
        let cap = 16 * 1024;
        let mut reader = PictureReader::new(Chunks(VecDeque::new()), 30, cap);
        reader.push(&START_MARKER);
        for _ in 0..100 {
            reader.push(&[0x42; READ_CHUNK]);
            assert!(reader.buffered_len() <= cap);
            assert!(reader.take_picture().is_none());
        }
    }
}
