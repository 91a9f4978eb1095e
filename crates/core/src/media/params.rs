//! SPS/PPS extraction with layered fallbacks.
//!
//! A stream can only be announced with `sprop-parameter-sets` once both
//! parameter sets are known. Inputs arrive in several framings, so
//! [`ParameterExtractor`] tries a fixed list of [`ParameterStrategy`]
//! implementations and returns the first complete result:
//!
//! 1. [`ContainerProbe`]: out-of-band codec configuration via `ffprobe`.
//! 2. [`DecoderPass`]: `ffmpeg` rewrites the video to Annex B on stdout.
//! 3. [`ByteScan`]: the file or pipe is read directly.
//!
//! All three normalize into [`H264Parameters`].

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::h264::{self, nal_type, nal_unit_type};
use crate::error::{Result, RtspError};
use crate::source::transcode::MediaTools;

const READ_CHUNK: usize = 8192;
const TS_PACKET_LEN: usize = 188;
const TS_SYNC: u8 = 0x47;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Extensions whose containers carry codec configuration out of band.
const CONTAINER_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "flv"];

/// SPS and PPS NAL units, each including its header byte and excluding the
/// start code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Parameters {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

impl H264Parameters {
    /// `profile-level-id` (RFC 6184 §8.1): SPS bytes 1–3 are profile_idc,
    /// constraint flags and level_idc.
    pub fn profile_level_id(&self) -> Option<String> {
        (self.sps.len() >= 4)
            .then(|| format!("{:02X}{:02X}{:02X}", self.sps[1], self.sps[2], self.sps[3]))
    }

    /// `sprop-parameter-sets` value: base64 SPS and PPS joined by a comma.
    pub fn sprop_parameter_sets(&self) -> String {
        format!(
            "{},{}",
            BASE64_STANDARD.encode(&self.sps),
            BASE64_STANDARD.encode(&self.pps)
        )
    }
}

/// Bounds applied to every scanning strategy.
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    /// Maximum number of bytes read before giving up.
    pub max_bytes: usize,
    /// Maximum wall-clock time spent waiting for data.
    pub timeout: Duration,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Accumulates the first SPS and PPS seen.
#[derive(Debug, Default, Clone)]
pub struct ParameterScan {
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
}

impl ParameterScan {
    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// Record a NAL unit if it is the first of its type. Returns whether
    /// both parameter sets are now known.
    pub fn offer(&mut self, nal: &[u8]) -> bool {
        if let Some(&header) = nal.first() {
            match nal_unit_type(header) {
                nal_type::SPS if self.sps.is_none() => self.sps = Some(nal.to_vec()),
                nal_type::PPS if self.pps.is_none() => self.pps = Some(nal.to_vec()),
                _ => {}
            }
        }
        self.is_complete()
    }

    /// Merge another scan, keeping values already found.
    pub fn merge(&mut self, other: ParameterScan) {
        if self.sps.is_none() {
            self.sps = other.sps;
        }
        if self.pps.is_none() {
            self.pps = other.pps;
        }
    }

    pub fn into_parameters(self) -> Option<H264Parameters> {
        match (self.sps, self.pps) {
            (Some(sps), Some(pps)) => Some(H264Parameters { sps, pps }),
            _ => None,
        }
    }

    fn missing(&self) -> &'static str {
        match (&self.sps, &self.pps) {
            (None, None) => "neither SPS nor PPS found",
            (None, Some(_)) => "SPS not found",
            (Some(_), None) => "PPS not found",
            (Some(_), Some(_)) => "complete",
        }
    }
}

/// Scan a complete Annex B buffer, stopping as soon as both sets are found.
pub fn scan_annex_b(data: &[u8]) -> ParameterScan {
    let mut scan = ParameterScan::default();
    for nal in h264::AnnexBUnits::new(data) {
        if scan.offer(nal) {
            break;
        }
    }
    scan
}

/// Scan a complete buffer of 188-byte transport stream packets.
pub fn scan_transport_stream(data: &[u8]) -> ParameterScan {
    let mut scanner = TsScanner::default();
    scanner.push(data);
    scanner.finish()
}

/// Incremental Annex B scanner for data arriving in chunks.
///
/// Only NAL units terminated by a following start code are inspected until
/// [`finish`](Self::finish), so a unit split across chunks is never
/// captured truncated.
#[derive(Debug, Default)]
pub struct AnnexBScanner {
    buf: Vec<u8>,
    scan: ParameterScan,
}

impl AnnexBScanner {
    /// Feed bytes. Returns whether both parameter sets are now known.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.scan.is_complete() {
            return true;
        }
        self.buf.extend_from_slice(data);

        let Some((mut consumed, mut nal_start)) = h264::find_start_code(&self.buf, 0) else {
            // Keep a possible partial start code.
            let keep = self.buf.len().min(3);
            self.buf.drain(..self.buf.len() - keep);
            return false;
        };
        while let Some((end, next)) = h264::find_start_code(&self.buf, nal_start) {
            if nal_start < end && self.scan.offer(&self.buf[nal_start..end]) {
                self.buf.clear();
                return true;
            }
            consumed = end;
            nal_start = next;
        }
        self.buf.drain(..consumed);
        false
    }

    /// Treat the buffered tail as a complete NAL unit and return the result.
    pub fn finish(mut self) -> ParameterScan {
        if !self.scan.is_complete() {
            let tail = scan_annex_b(&self.buf);
            self.scan.merge(tail);
        }
        self.scan
    }
}

/// Incremental scanner for NAL units carried inside transport stream packets.
///
/// Each packet's payload (after the 4-byte header and any adaptation field)
/// is appended to a per-PID [`AnnexBScanner`], so NAL units that straddle
/// packet boundaries are reassembled before being inspected.
#[derive(Debug, Default)]
pub struct TsScanner {
    pending: Vec<u8>,
    pids: HashMap<u16, AnnexBScanner>,
}

impl TsScanner {
    /// Feed bytes. Returns whether both parameter sets are now known.
    pub fn push(&mut self, data: &[u8]) -> bool {
        self.pending.extend_from_slice(data);
        let mut i = 0;
        while i + TS_PACKET_LEN <= self.pending.len() {
            let aligned = self.pending[i] == TS_SYNC
                && (i + TS_PACKET_LEN == self.pending.len()
                    || self.pending[i + TS_PACKET_LEN] == TS_SYNC);
            if !aligned {
                i += 1;
                continue;
            }
            let packet = &self.pending[i..i + TS_PACKET_LEN];
            i += TS_PACKET_LEN;
            let complete = match ts_payload(packet) {
                Some((pid, payload)) => self.pids.entry(pid).or_default().push(payload),
                None => false,
            };
            if complete {
                self.pending.clear();
                return true;
            }
        }
        self.pending.drain(..i);
        false
    }

    pub fn finish(self) -> ParameterScan {
        let mut complete = ParameterScan::default();
        let mut partial = ParameterScan::default();
        for scanner in self.pids.into_values() {
            let scan = scanner.finish();
            if scan.is_complete() && !complete.is_complete() {
                complete = scan;
            } else {
                partial.merge(scan);
            }
        }
        complete.merge(partial);
        complete
    }
}

/// Returns `(pid, payload)` of a 188-byte TS packet, skipping the header and
/// adaptation field. `None` when the packet carries no payload.
pub(crate) fn ts_payload(packet: &[u8]) -> Option<(u16, &[u8])> {
    if packet.len() < 4 || packet[0] != TS_SYNC {
        return None;
    }
    let pid = u16::from_be_bytes([packet[1] & 0x1f, packet[2]]);
    let adaptation_control = (packet[3] >> 4) & 0x03;
    let mut start = 4;
    if adaptation_control == 2 || adaptation_control == 3 {
        start += 1 + *packet.get(4)? as usize;
    }
    if adaptation_control == 2 || start >= packet.len() {
        return None;
    }
    Some((pid, &packet[start..]))
}

/// Parse an AVCDecoderConfigurationRecord (ISO/IEC 14496-15 §5.2.4.1):
///
/// ```text
/// configurationVersion (1) | AVCProfileIndication (1) | profile_compatibility (1)
/// | AVCLevelIndication (1) | lengthSizeMinusOne (1, lower 2 bits)
/// | numOfSPS (1, lower 5 bits) | { spsLength (2) | spsNALUnit }*
/// | numOfPPS (1) | { ppsLength (2) | ppsNALUnit }*
/// ```
///
/// The first SPS and first PPS are returned.
pub fn parse_avc_decoder_configuration(data: &[u8]) -> Option<H264Parameters> {
    if data.len() < 7 || data[0] != 1 {
        return None;
    }
    let mut rest = &data[5..];
    let mut take_sets = |count_mask: u8| -> Option<Vec<Vec<u8>>> {
        let (&count, tail) = rest.split_first()?;
        rest = tail;
        let mut sets = Vec::new();
        for _ in 0..(count & count_mask) {
            if rest.len() < 2 {
                return None;
            }
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            let set = rest.get(2..2 + len)?;
            sets.push(set.to_vec());
            rest = &rest[2 + len..];
        }
        Some(sets)
    };
    let sps = take_sets(0x1f)?.into_iter().find(|s| !s.is_empty())?;
    let pps = take_sets(0xff)?.into_iter().find(|s| !s.is_empty())?;
    Some(H264Parameters { sps, pps })
}

/// One way of recovering SPS/PPS from a source path.
pub trait ParameterStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Attempt extraction. Any error lets the next strategy run.
    fn extract(&self, path: &Path) -> Result<H264Parameters>;
}

/// Tries each [`ParameterStrategy`] in order, first success wins.
pub struct ParameterExtractor {
    strategies: Vec<Box<dyn ParameterStrategy>>,
}

impl ParameterExtractor {
    /// Default strategy order: container probe, decoder pass, byte scan.
    pub fn new(tools: MediaTools, limits: ScanLimits) -> Self {
        Self::with_strategies(vec![
            Box::new(ContainerProbe::new(tools.clone())),
            Box::new(DecoderPass::new(tools, limits)),
            Box::new(ByteScan::new(limits)),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn ParameterStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn extract(&self, path: &Path) -> Result<H264Parameters> {
        let mut reasons = Vec::new();
        for strategy in &self.strategies {
            match strategy.extract(path) {
                Ok(params) => {
                    tracing::info!(
                        strategy = strategy.name(),
                        sps_len = params.sps.len(),
                        pps_len = params.pps.len(),
                        "extracted H.264 parameters"
                    );
                    return Ok(params);
                }
                Err(e) => {
                    tracing::debug!(strategy = strategy.name(), error = %e, "parameter strategy failed");
                    reasons.push(format!("{}: {e}", strategy.name()));
                }
            }
        }
        Err(RtspError::ParameterNotFound(reasons.join("; ")))
    }
}

/// Reads the codec configuration record of boxed containers via `ffprobe`.
pub struct ContainerProbe {
    tools: MediaTools,
}

impl ContainerProbe {
    pub fn new(tools: MediaTools) -> Self {
        Self { tools }
    }
}

impl ParameterStrategy for ContainerProbe {
    fn name(&self) -> &'static str {
        "container-probe"
    }

    fn extract(&self, path: &Path) -> Result<H264Parameters> {
        let is_container = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| CONTAINER_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !is_container {
            return Err(RtspError::ParameterNotFound(
                "no out-of-band configuration for this format".into(),
            ));
        }
        require_regular_file(path)?;

        let output = Command::new(&self.tools.ffprobe)
            .args(["-v", "quiet", "-show_entries", "stream=codec_name,extradata"])
            .args(["-select_streams", "v:0", "-of", "csv=p=0"])
            .arg(path)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(RtspError::ParameterNotFound(format!(
                "ffprobe exited with {}",
                output.status
            )));
        }
        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `codec_name,extradata` lines printed by `ffprobe`.
pub fn parse_probe_output(output: &str) -> Result<H264Parameters> {
    for line in output.lines() {
        let Some((codec, extradata)) = line.split_once(',') else {
            continue;
        };
        if codec.trim() != "h264" {
            continue;
        }
        let hex_text: String = extradata.chars().filter(char::is_ascii_hexdigit).collect();
        let Ok(bytes) = hex::decode(&hex_text) else {
            continue;
        };
        let params = parse_avc_decoder_configuration(&bytes)
            .or_else(|| scan_annex_b(&bytes).into_parameters());
        if let Some(params) = params {
            return Ok(params);
        }
    }
    Err(RtspError::ParameterNotFound("no H.264 extradata".into()))
}

/// Pipes the input through `ffmpeg` as an Annex B elementary stream and scans
/// the leading NAL units.
pub struct DecoderPass {
    tools: MediaTools,
    limits: ScanLimits,
}

impl DecoderPass {
    pub fn new(tools: MediaTools, limits: ScanLimits) -> Self {
        Self { tools, limits }
    }
}

impl ParameterStrategy for DecoderPass {
    fn name(&self) -> &'static str {
        "decoder-pass"
    }

    fn extract(&self, path: &Path) -> Result<H264Parameters> {
        require_regular_file(path)?;
        let mut child = Command::new(&self.tools.ffmpeg)
            .args(["-v", "error", "-i"])
            .arg(path)
            .args(["-c:v", "copy", "-bsf:v", "h264_mp4toannexb"])
            .args(["-an", "-f", "h264", "-y", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RtspError::ParameterNotFound("ffmpeg stdout unavailable".into()))?;

        let result = scan_with_deadline(stdout, self.limits, SniffMode::AnnexB);
        if let Err(e) = child.kill() {
            tracing::trace!(error = %e, "ffmpeg already exited");
        }
        match child.wait() {
            Ok(status) => tracing::trace!(%status, "ffmpeg reaped"),
            Err(e) => tracing::trace!(error = %e, "failed to reap ffmpeg"),
        }
        result
    }
}

/// Subprocess strategies consume what they read, so pipes and devices are
/// left to [`ByteScan`].
fn require_regular_file(path: &Path) -> Result<()> {
    if std::fs::metadata(path)?.is_file() {
        Ok(())
    } else {
        Err(RtspError::ParameterNotFound(format!(
            "{} is not a regular file",
            path.display()
        )))
    }
}

/// Reads the file or named pipe directly, accepting raw Annex B or
/// transport stream framing.
pub struct ByteScan {
    limits: ScanLimits,
}

impl ByteScan {
    pub fn new(limits: ScanLimits) -> Self {
        Self { limits }
    }
}

impl ParameterStrategy for ByteScan {
    fn name(&self) -> &'static str {
        "byte-scan"
    }

    fn extract(&self, path: &Path) -> Result<H264Parameters> {
        if !path.exists() {
            return Err(RtspError::ParameterNotFound(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let (tx, rx) = mpsc::channel();
        let owned = path.to_path_buf();
        // Opening a FIFO blocks until a writer appears, so the open happens
        // on the helper thread too. After a timeout the thread stays parked in
        // `open` until a writer shows up; the file is then dropped unread.
        thread::Builder::new()
            .name("param-open".into())
            .spawn(move || {
                let _ = tx.send(File::open(owned));
            })?;

        let deadline = Instant::now() + self.limits.timeout;
        let file = loop {
            match rx.recv_timeout(PROGRESS_INTERVAL) {
                Ok(file) => break file?,
                Err(mpsc::RecvTimeoutError::Timeout) if Instant::now() < deadline => {
                    tracing::debug!(path = %path.display(), "waiting for a writer to open the pipe");
                }
                Err(_) => {
                    return Err(RtspError::ParameterNotFound(format!(
                        "timed out opening {} after {:?}",
                        path.display(),
                        self.limits.timeout
                    )));
                }
            }
        };

        let remaining = ScanLimits {
            timeout: deadline.saturating_duration_since(Instant::now()),
            ..self.limits
        };
        scan_with_deadline(file, remaining, SniffMode::Detect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SniffMode {
    AnnexB,
    /// Choose transport stream scanning when the data is 188-byte aligned
    /// on sync bytes, Annex B otherwise.
    Detect,
}

enum ScanMessage {
    Progress(usize),
    Done(Result<ParameterScan>),
}

/// Read `reader` on a helper thread until both parameter sets are found,
/// EOF, the byte cap, or the deadline.
fn scan_with_deadline<R>(reader: R, limits: ScanLimits, mode: SniffMode) -> Result<H264Parameters>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("param-scan".into())
        .spawn(move || {
            let result = scan_reader(reader, limits.max_bytes, mode, |n| {
                let _ = tx.send(ScanMessage::Progress(n));
            });
            let _ = tx.send(ScanMessage::Done(result));
        })?;

    let deadline = Instant::now() + limits.timeout;
    loop {
        let wait = deadline
            .saturating_duration_since(Instant::now())
            .min(PROGRESS_INTERVAL);
        match rx.recv_timeout(wait) {
            Ok(ScanMessage::Done(result)) => {
                let scan = result?;
                let reason = scan.missing();
                return scan
                    .into_parameters()
                    .ok_or_else(|| RtspError::ParameterNotFound(reason.into()));
            }
            Ok(ScanMessage::Progress(total)) => {
                tracing::trace!(bytes = total, "scanning for parameter sets");
            }
            Err(mpsc::RecvTimeoutError::Timeout) if Instant::now() < deadline => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(RtspError::ParameterNotFound(format!(
                    "timed out after {:?}",
                    limits.timeout
                )));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(RtspError::ParameterNotFound("scanner exited".into()));
            }
        }
    }
}

fn scan_reader<R: Read>(
    mut reader: R,
    max_bytes: usize,
    mode: SniffMode,
    mut progress: impl FnMut(usize),
) -> Result<ParameterScan> {
    let mut chunk = [0u8; READ_CHUNK];
    let mut head: Vec<u8> = Vec::new();
    let mut annex_b = AnnexBScanner::default();
    let mut ts = TsScanner::default();
    let mut use_ts: Option<bool> = (mode == SniffMode::AnnexB).then_some(false);
    let mut total = 0usize;

    while total < max_bytes {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        total += n;
        progress(total);

        let data: &[u8] = match use_ts {
            Some(_) => &chunk[..n],
            None => {
                head.extend_from_slice(&chunk[..n]);
                if head.len() <= TS_PACKET_LEN {
                    continue;
                }
                use_ts = Some(head[0] == TS_SYNC && head[TS_PACKET_LEN] == TS_SYNC);
                &head
            }
        };
        let complete = if use_ts == Some(true) {
            ts.push(data)
        } else {
            annex_b.push(data)
        };
        head.clear();
        if complete {
            break;
        }
    }

    if use_ts.is_none() {
        use_ts = Some(head.first() == Some(&TS_SYNC) && head.len() == TS_PACKET_LEN);
        if use_ts == Some(true) {
            ts.push(&head);
        } else {
            annex_b.push(&head);
        }
    }

    Ok(if use_ts == Some(true) {
        ts.finish()
    } else {
        annex_b.finish()
    })
}
