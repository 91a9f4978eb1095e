//! Input sources producing H.264 access units.
//!
//! Every input is read through [`SourceReader`], a pull-based sequence of
//! [`SourceEvent`]s. Container files are transcoded to MPEG-TS once at open
//! time and then read like any transport stream.
//!
//! ```text
//! .ts            -> TsDemuxer ----------------------\
//! .mp4/.mov/...  -> ffmpeg -> temp .ts -> TsDemuxer --> SourceEvent
//! anything else  -> PictureReader (named pipe) -----/
//! ```

pub mod mjpeg;
pub mod transcode;
pub mod ts;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::Result;
use crate::media::h264::{nal_type, nal_unit_type};
use crate::media::params::ScanLimits;
use mjpeg::PictureReader;
use transcode::{MediaTools, TranscodedFile};
use ts::TsDemuxer;

/// One coded frame: NAL units without start codes, timestamps in 90 kHz
/// ticks relative to the start of the current pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub pts: i64,
    pub dts: i64,
    pub nalus: Vec<Vec<u8>>,
}

impl AccessUnit {
    pub fn is_keyframe(&self) -> bool {
        self.nalus
            .iter()
            .any(|nal| nal.first().is_some_and(|&b| nal_unit_type(b) == nal_type::IDR))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    AccessUnit(AccessUnit),
    /// The source looped back to its beginning; timestamps restart near zero.
    Restart,
}

/// Pull-based producer of [`SourceEvent`]s.
pub trait EventSource: Send {
    fn next_event(&mut self) -> Result<SourceEvent>;
}

/// Input classification, by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    TransportStream,
    /// Needs transcoding to a transport stream before reading.
    Container,
    /// Unframed picture stream, typically a named pipe.
    RawPipe,
}

impl SourceKind {
    pub fn classify(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("ts") => Self::TransportStream,
            Some("mp4" | "mov" | "m4v" | "mkv" | "flv") => Self::Container,
            _ => Self::RawPipe,
        }
    }
}

/// Settings for opening and probing sources.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Frame rate used to synthesize timestamps for raw pipes.
    pub nominal_fps: u32,
    /// Upper bound on the raw pipe's picture buffer.
    pub pipe_buffer_cap: usize,
    /// Limits for SPS/PPS scanning.
    pub probe: ScanLimits,
    pub tools: MediaTools,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            nominal_fps: 30,
            pipe_buffer_cap: mjpeg::DEFAULT_BUFFER_CAP,
            probe: ScanLimits::default(),
            tools: MediaTools::default(),
        }
    }
}

/// A source opened for reading.
pub enum SourceReader {
    TransportStream {
        demuxer: TsDemuxer<BufReader<File>>,
        /// Keeps a transcoded temp file alive for as long as it is read.
        _transcoded: Option<TranscodedFile>,
    },
    RawPipe(PictureReader<File>),
}

impl SourceReader {
    /// Classify and open `path`, transcoding container inputs first.
    pub fn open(path: &Path, config: &SourceConfig) -> Result<Self> {
        let kind = SourceKind::classify(path);
        tracing::info!(path = %path.display(), ?kind, "opening source");
        match kind {
            SourceKind::TransportStream => Ok(Self::TransportStream {
                demuxer: open_demuxer(path)?,
                _transcoded: None,
            }),
            SourceKind::Container => {
                let transcoded = transcode::to_transport_stream(&config.tools, path)?;
                Ok(Self::TransportStream {
                    demuxer: open_demuxer(transcoded.path())?,
                    _transcoded: Some(transcoded),
                })
            }
            SourceKind::RawPipe => Ok(Self::RawPipe(PictureReader::new(
                File::open(path)?,
                config.nominal_fps,
                config.pipe_buffer_cap,
            ))),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::TransportStream { .. } => SourceKind::TransportStream,
            Self::RawPipe(_) => SourceKind::RawPipe,
        }
    }

    /// Next access unit or restart marker. Blocks on file or pipe reads.
    pub fn next_event(&mut self) -> Result<SourceEvent> {
        match self {
            Self::TransportStream { demuxer, .. } => demuxer.next_event(),
            Self::RawPipe(reader) => reader.next_event(),
        }
    }
}

/// Open a transport stream and make sure it carries an H.264 track.
fn open_demuxer(path: &Path) -> Result<TsDemuxer<BufReader<File>>> {
    let mut demuxer = TsDemuxer::new(BufReader::new(File::open(path)?));
    let pid = demuxer.probe_track()?;
    tracing::debug!(path = %path.display(), pid, "H.264 track located");
    Ok(demuxer)
}

impl EventSource for SourceReader {
    fn next_event(&mut self) -> Result<SourceEvent> {
        SourceReader::next_event(self)
    }
}
