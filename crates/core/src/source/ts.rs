//! MPEG transport stream demuxer (ISO/IEC 13818-1) for the H.264 track.
//!
//! Only what a looping file source needs is parsed: PAT, PMT, and PES
//! packets on the first elementary stream of type `0x1B`. Continuity
//! counters, PCR and descriptors are ignored.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};

use super::{AccessUnit, SourceEvent};
use crate::error::{Result, RtspError};
use crate::media::h264::{self, nal_type, nal_unit_type};
use crate::media::params::ts_payload;

pub const PACKET_LEN: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const STREAM_TYPE_H264: u8 = 0x1b;

/// Packets read without locating an H.264 stream before giving up.
const TRACK_PROBE_PACKETS: usize = 20_000;

const TIMESTAMP_BITS: u32 = 33;
const TIMESTAMP_MODULUS: i64 = 1 << TIMESTAMP_BITS;

/// Converts 33-bit MPEG timestamps into a continuous 90 kHz timeline.
///
/// The first decoded value maps to zero. Later values are accumulated from
/// the signed difference to the previous one, so a wrap of the 33-bit
/// counter (every ~26.5 hours) does not produce a jump.
#[derive(Debug, Default)]
pub struct TimeDecoder {
    last_raw: Option<i64>,
    elapsed: i64,
}

impl TimeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, raw: u64) -> i64 {
        let raw = raw as i64 & (TIMESTAMP_MODULUS - 1);
        if let Some(last) = self.last_raw {
            self.elapsed += wrapped_diff(raw, last);
        }
        self.last_raw = Some(raw);
        self.elapsed
    }

    /// Offset `raw` against the last decoded value without advancing state.
    pub fn relative(&self, raw: u64) -> i64 {
        let raw = raw as i64 & (TIMESTAMP_MODULUS - 1);
        match self.last_raw {
            Some(last) => self.elapsed + wrapped_diff(raw, last),
            None => 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Signed difference `a - b` in 33-bit modular arithmetic.
fn wrapped_diff(a: i64, b: i64) -> i64 {
    let diff = (a - b).rem_euclid(TIMESTAMP_MODULUS);
    if diff >= TIMESTAMP_MODULUS / 2 {
        diff - TIMESTAMP_MODULUS
    } else {
        diff
    }
}

#[derive(Debug, Default)]
struct PesAssembly {
    data: Vec<u8>,
}

/// Pull-based demuxer yielding H.264 access units from a seekable stream.
///
/// At end of input the final buffered unit is emitted, the stream is
/// rewound and a [`SourceEvent::Restart`] follows.
pub struct TsDemuxer<R> {
    reader: R,
    pmt_pid: Option<u16>,
    video_pid: Option<u16>,
    pes: Option<PesAssembly>,
    time: TimeDecoder,
    ready: VecDeque<AccessUnit>,
    restart_pending: bool,
    packets_this_pass: usize,
    units_this_pass: usize,
}

impl<R: Read + Seek> TsDemuxer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pmt_pid: None,
            video_pid: None,
            pes: None,
            time: TimeDecoder::new(),
            ready: VecDeque::new(),
            restart_pending: false,
            packets_this_pass: 0,
            units_this_pass: 0,
        }
    }

    /// PID of the H.264 elementary stream, once the PMT has been seen.
    pub fn video_pid(&self) -> Option<u16> {
        self.video_pid
    }

    /// Read ahead until the PMT names an H.264 stream, then rewind.
    ///
    /// Fails with [`RtspError::TrackNotFound`] at end of input or after
    /// the packet probe bound, so callers can reject the source before
    /// announcing it.
    pub fn probe_track(&mut self) -> Result<u16> {
        let mut packets = 0usize;
        let found = loop {
            if let Some(pid) = self.video_pid {
                break pid;
            }
            let Some(packet) = self.read_packet()? else {
                return Err(RtspError::TrackNotFound);
            };
            packets += 1;
            if packets > TRACK_PROBE_PACKETS {
                return Err(RtspError::TrackNotFound);
            }
            self.handle_packet(&packet);
        };
        self.reader.seek(SeekFrom::Start(0))?;
        self.pes = None;
        self.packets_this_pass = 0;
        Ok(found)
    }

    pub fn next_event(&mut self) -> Result<SourceEvent> {
        loop {
            if let Some(unit) = self.ready.pop_front() {
                return Ok(SourceEvent::AccessUnit(unit));
            }
            if self.restart_pending {
                self.restart_pending = false;
                return Ok(SourceEvent::Restart);
            }

            match self.read_packet()? {
                Some(packet) => {
                    self.packets_this_pass += 1;
                    self.handle_packet(&packet);
                    if self.video_pid.is_none() && self.packets_this_pass > TRACK_PROBE_PACKETS {
                        return Err(RtspError::TrackNotFound);
                    }
                }
                None => self.rewind()?,
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        self.flush_pes();
        if self.video_pid.is_none() {
            return Err(RtspError::TrackNotFound);
        }
        if self.units_this_pass == 0 && self.ready.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "transport stream contains no access units",
            )
            .into());
        }

        tracing::info!(
            packets = self.packets_this_pass,
            units = self.units_this_pass,
            "end of transport stream, rewinding"
        );
        self.reader.seek(SeekFrom::Start(0))?;
        self.pes = None;
        self.time.reset();
        self.packets_this_pass = 0;
        self.units_this_pass = 0;
        self.restart_pending = true;
        Ok(())
    }

    /// Read one packet, resynchronizing on the sync byte. `None` at EOF.
    fn read_packet(&mut self) -> Result<Option<[u8; PACKET_LEN]>> {
        let mut packet = [0u8; PACKET_LEN];
        if !read_full(&mut self.reader, &mut packet)? {
            return Ok(None);
        }
        while packet[0] != SYNC_BYTE {
            let skip = packet[1..]
                .iter()
                .position(|&b| b == SYNC_BYTE)
                .map_or(PACKET_LEN, |p| p + 1);
            tracing::debug!(skip, "transport stream out of sync");
            packet.copy_within(skip.., 0);
            if !read_full(&mut self.reader, &mut packet[PACKET_LEN - skip..])? {
                return Ok(None);
            }
        }
        Ok(Some(packet))
    }

    fn handle_packet(&mut self, packet: &[u8; PACKET_LEN]) {
        let unit_start = packet[1] & 0x40 != 0;
        let Some((pid, payload)) = ts_payload(packet) else {
            return;
        };

        if pid == PAT_PID {
            if let Some(pmt) = section(payload, unit_start).and_then(parse_pat) {
                self.pmt_pid = Some(pmt);
            }
        } else if Some(pid) == self.pmt_pid {
            if self.video_pid.is_none()
                && let Some(video) = section(payload, unit_start).and_then(parse_pmt)
            {
                tracing::debug!(pid = video, "found H.264 elementary stream");
                self.video_pid = Some(video);
            }
        } else if Some(pid) == self.video_pid {
            if unit_start {
                self.flush_pes();
                self.pes = Some(PesAssembly::default());
            }
            if let Some(pes) = self.pes.as_mut() {
                pes.data.extend_from_slice(payload);
            }
        }
    }

    fn flush_pes(&mut self) {
        let Some(pes) = self.pes.take() else {
            return;
        };
        let Some(parsed) = parse_pes(&pes.data) else {
            tracing::debug!(len = pes.data.len(), "dropping malformed PES packet");
            return;
        };
        let Some(raw_pts) = parsed.pts else {
            tracing::debug!("dropping PES packet without PTS");
            return;
        };
        let raw_dts = parsed.dts.unwrap_or(raw_pts);

        let nalus: Vec<Vec<u8>> = h264::split_annex_b(parsed.payload)
            .into_iter()
            .filter(|nal| nal.first().is_some_and(|&b| nal_unit_type(b) != nal_type::AUD))
            .collect();
        if nalus.is_empty() {
            return;
        }

        let dts = self.time.decode(raw_dts);
        let pts = self.time.relative(raw_pts);
        self.units_this_pass += 1;
        self.ready.push_back(AccessUnit { pts, dts, nalus });
    }
}

/// Fill `buf` completely. `false` if EOF arrives first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Start of a PSI section, skipping the pointer field. Sections spanning
/// several packets are not reassembled; PAT and PMT fit in one in practice.
fn section(payload: &[u8], unit_start: bool) -> Option<&[u8]> {
    if !unit_start {
        return None;
    }
    let pointer = *payload.first()? as usize;
    payload.get(1 + pointer..)
}

/// Body of a long-form section between the 8-byte header and the CRC.
fn section_body(section: &[u8], table_id: u8) -> Option<&[u8]> {
    if section.len() < 3 || section[0] != table_id {
        return None;
    }
    let length = (u16::from_be_bytes([section[1], section[2]]) & 0x0fff) as usize;
    let end = (3 + length).checked_sub(4)?;
    section.get(8..end)
}

/// First program's PMT PID from a PAT section.
fn parse_pat(section: &[u8]) -> Option<u16> {
    section_body(section, 0x00)?
        .chunks_exact(4)
        .find(|entry| u16::from_be_bytes([entry[0], entry[1]]) != 0)
        .map(|entry| u16::from_be_bytes([entry[2], entry[3]]) & 0x1fff)
}

/// PID of the first H.264 elementary stream in a PMT section.
fn parse_pmt(section: &[u8]) -> Option<u16> {
    let body = section_body(section, 0x02)?;
    if body.len() < 4 {
        return None;
    }
    let program_info_len = (u16::from_be_bytes([body[2], body[3]]) & 0x0fff) as usize;
    let mut streams = body.get(4 + program_info_len..)?;
    while streams.len() >= 5 {
        let stream_type = streams[0];
        let pid = u16::from_be_bytes([streams[1], streams[2]]) & 0x1fff;
        let info_len = (u16::from_be_bytes([streams[3], streams[4]]) & 0x0fff) as usize;
        if stream_type == STREAM_TYPE_H264 {
            return Some(pid);
        }
        streams = streams.get(5 + info_len..)?;
    }
    None
}

struct Pes<'a> {
    pts: Option<u64>,
    dts: Option<u64>,
    payload: &'a [u8],
}

fn parse_pes(data: &[u8]) -> Option<Pes<'_>> {
    if data.len() < 9 || data[..3] != [0, 0, 1] {
        return None;
    }
    let flags = data[7] >> 6;
    let header_len = data[8] as usize;
    let payload = data.get(9 + header_len..)?;
    let optional = &data[9..9 + header_len];

    let pts = if flags & 0b10 != 0 {
        optional.get(..5).map(parse_timestamp)
    } else {
        None
    };
    let dts = if flags == 0b11 {
        optional.get(5..10).map(parse_timestamp)
    } else {
        None
    };
    Some(Pes { pts, dts, payload })
}

/// Decode the 5-byte PTS/DTS encoding with its marker bits.
fn parse_timestamp(b: &[u8]) -> u64 {
    (((b[0] >> 1) & 0x07) as u64) << 30
        | (b[1] as u64) << 22
        | ((b[2] >> 1) as u64) << 15
        | (b[3] as u64) << 7
        | (b[4] >> 1) as u64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) const VIDEO_PID: u16 = 0x100;
    const PMT_PID: u16 = 0x1000;

    fn packet(pid: u16, unit_start: bool, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= PACKET_LEN - 4);
        let mut out = vec![SYNC_BYTE, (pid >> 8) as u8 & 0x1f, pid as u8];
        if unit_start {
            out[1] |= 0x40;
        }
        let stuffing = PACKET_LEN - 4 - payload.len();
        if stuffing == 0 {
            out.push(0x10);
        } else {
            out.push(0x30);
            out.push((stuffing - 1) as u8);
            if stuffing > 1 {
                out.push(0);
                out.extend(std::iter::repeat_n(0xff, stuffing - 2));
            }
        }
        out.extend_from_slice(payload);
        out
    }

    fn psi(table_id: u8, id: u16, body: &[u8]) -> Vec<u8> {
        let length = (5 + body.len() + 4) as u16;
        let mut out = vec![0, table_id];
        out.extend_from_slice(&(0xb000 | length).to_be_bytes());
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&[0xc1, 0, 0]);
        out.extend_from_slice(body);
        out.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        out
    }

    fn encode_timestamp(marker: u8, ts: u64) -> [u8; 5] {
        [
            (marker << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 1,
            (ts >> 22) as u8,
            (((ts >> 15) & 0x7f) as u8) << 1 | 1,
            (ts >> 7) as u8,
            ((ts & 0x7f) as u8) << 1 | 1,
        ]
    }

    /// Minimal muxer: PAT, PMT, then one PES per access unit.
    pub(crate) fn mux(units: &[(u64, u64, Vec<Vec<u8>>)], stream_type: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let pat_body = [0x00, 0x01, 0xe0 | (PMT_PID >> 8) as u8, PMT_PID as u8];
        out.extend(packet(PAT_PID, true, &psi(0x00, 1, &pat_body)));
        let pmt_body = [
            0xe0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xf0,
            0x00,
            stream_type,
            0xe0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xf0,
            0x00,
        ];
        out.extend(packet(PMT_PID, true, &psi(0x02, 1, &pmt_body)));

        for (pts, dts, nalus) in units {
            let mut pes = vec![0, 0, 1, 0xe0, 0, 0, 0x80, 0xc0, 10];
            pes.extend(encode_timestamp(0x3, *pts));
            pes.extend(encode_timestamp(0x1, *dts));
            pes.extend_from_slice(&[0, 0, 0, 1, 0x09, 0xf0]);
            for nal in nalus {
                pes.extend_from_slice(&[0, 0, 0, 1]);
                pes.extend_from_slice(nal);
            }
            for (i, chunk) in pes.chunks(PACKET_LEN - 4).enumerate() {
                out.extend(packet(VIDEO_PID, i == 0, chunk));
            }
        }
        out
    }

    fn collect_pass(demuxer: &mut TsDemuxer<Cursor<Vec<u8>>>) -> Vec<AccessUnit> {
        let mut units = Vec::new();
        loop {
            match demuxer.next_event().unwrap() {
                SourceEvent::AccessUnit(unit) => units.push(unit),
                SourceEvent::Restart => return units,
            }
        }
    }

    #[test]
    fn time_decoder_is_relative_and_handles_wrap() {
        let mut decoder = TimeDecoder::new();
        assert_eq!(decoder.decode(1_000), 0);
        assert_eq!(decoder.decode(4_000), 3_000);
        assert_eq!(decoder.relative(10_000), 9_000);

        let mut decoder = TimeDecoder::new();
        let near_wrap = (TIMESTAMP_MODULUS - 1_500) as u64;
        assert_eq!(decoder.decode(near_wrap), 0);
        assert_eq!(decoder.decode(1_500), 3_000);
        assert_eq!(decoder.relative(near_wrap), 0);
    }

    #[test]
    fn demuxes_access_units_and_drops_delimiters() {
        let big_idr = [vec![0x65], vec![0xab; 700]].concat();
        let units = vec![
            (
                126_000,
                120_000,
                vec![vec![0x67, 0x64, 0, 0x1f], vec![0x68, 0xeb], big_idr.clone()],
            ),
            (129_000, 123_000, vec![vec![0x41, 1, 2, 3]]),
            (132_000, 126_000, vec![vec![0x41, 4, 5, 6]]),
        ];
        let mut demuxer = TsDemuxer::new(Cursor::new(mux(&units, STREAM_TYPE_H264)));
        let got = collect_pass(&mut demuxer);

        assert_eq!(demuxer.video_pid(), Some(VIDEO_PID));
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].dts, 0);
        assert_eq!(got[0].pts, 6_000);
        assert_eq!(got[0].nalus.len(), 3);
        assert_eq!(got[0].nalus[2], big_idr);
        assert_eq!(got[1].dts, 3_000);
        assert_eq!(got[2].dts, 6_000);
        assert_eq!(got[2].nalus, vec![vec![0x41, 4, 5, 6]]);
    }

    #[test]
    fn rewinds_and_restarts_timeline() {
        let units = vec![
            (9_000, 9_000, vec![vec![0x65, 1]]),
            (12_000, 12_000, vec![vec![0x41, 2]]),
        ];
        let mut demuxer = TsDemuxer::new(Cursor::new(mux(&units, STREAM_TYPE_H264)));
        let first = collect_pass(&mut demuxer);
        let second = collect_pass(&mut demuxer);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].dts, 0);
        assert_eq!(second[1].dts, 3_000);
    }

    #[test]
    fn missing_h264_stream_is_track_not_found() {
        let units = vec![(9_000, 9_000, vec![vec![0x65, 1]])];
        // 0x24 is HEVC.
        let mut demuxer = TsDemuxer::new(Cursor::new(mux(&units, 0x24)));
        assert!(matches!(
            demuxer.next_event(),
            Err(RtspError::TrackNotFound)
        ));
    }

    #[test]
    fn probe_track_finds_pid_and_rewinds() {
        let units = vec![(0, 0, vec![vec![0x65, 1, 2]]), (3_000, 3_000, vec![vec![0x41, 3]])];
        let mut demuxer = TsDemuxer::new(Cursor::new(mux(&units, STREAM_TYPE_H264)));
        let pid = demuxer.probe_track().unwrap();
        assert_eq!(demuxer.video_pid(), Some(pid));

        let pass = collect_pass(&mut demuxer);
        assert_eq!(pass.len(), 2);
        assert_eq!(pass[0].dts, 0);
    }

    #[test]
    fn probe_track_rejects_stream_without_h264() {
        let units = vec![(0, 0, vec![vec![0x26, 0x01, 0xaa]])];
        let mut demuxer = TsDemuxer::new(Cursor::new(mux(&units, 0x24)));
        assert!(matches!(demuxer.probe_track(), Err(RtspError::TrackNotFound)));
    }

    #[test]
    fn resyncs_after_garbage() {
        let units = vec![(9_000, 9_000, vec![vec![0x65, 1]])];
        let mut data = vec![0x00, 0x12, 0x34];
        data.extend(mux(&units, STREAM_TYPE_H264));
        let mut demuxer = TsDemuxer::new(Cursor::new(data));
        assert_eq!(collect_pass(&mut demuxer).len(), 1);
    }

    #[test]
    fn empty_input_is_an_error() {
        let mut demuxer = TsDemuxer::new(Cursor::new(Vec::new()));
        assert!(demuxer.next_event().is_err());
    }

    #[test]
    fn timestamp_encoding_round_trips() {
        let ts = (1u64 << 32) + 123_456;
        assert_eq!(parse_timestamp(&encode_timestamp(0x2, ts)), ts);
    }
}
