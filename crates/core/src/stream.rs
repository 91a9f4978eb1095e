//! The single active stream and its readers.
//!
//! A [`StreamHandle`] is the only way to reach the current
//! [`SharedStream`]. Publishing replaces the stream wholesale: the old one
//! is closed, its readers are dropped, and its publisher connection is told
//! to disconnect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::error::{Result, RtspError};
use crate::media::h264;
use crate::media::params::H264Parameters;
use crate::media::rtp::{RtpPacket, RtpView};
use crate::pacing::PacketSink;
use crate::transport::udp::{MulticastGroup, UdpTransport};

pub const H264_PAYLOAD_TYPE: u8 = 96;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Format {
    pub payload_type: u8,
    pub packetization_mode: u8,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
}

impl H264Format {
    pub fn parameters(&self) -> Option<H264Parameters> {
        match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) if !sps.is_empty() && !pps.is_empty() => Some(H264Parameters {
                sps: sps.clone(),
                pps: pps.clone(),
            }),
            _ => None,
        }
    }
}

/// Codec format of one payload type within a media entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    H264(H264Format),
    /// Any other codec, carried through as its rtpmap encoding line.
    Other {
        payload_type: u8,
        rtpmap: Option<String>,
        fmtp: Option<String>,
    },
}

impl Format {
    pub fn payload_type(&self) -> u8 {
        match self {
            Self::H264(f) => f.payload_type,
            Self::Other { payload_type, .. } => *payload_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Application,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Application => "application",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "application" => Some(Self::Application),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub media_type: MediaType,
    /// `a=control` as announced by a publisher.
    pub control: Option<String>,
    pub formats: Vec<Format>,
}

impl Media {
    pub fn h264(&self) -> Option<&H264Format> {
        self.formats.iter().find_map(|f| match f {
            Format::H264(h264) => Some(h264),
            Format::Other { .. } => None,
        })
    }
}

/// What a stream carries. Immutable once the stream is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescription {
    pub medias: Vec<Media>,
}

impl StreamDescription {
    /// A single H.264 video media, packetization mode 1.
    pub fn h264(params: Option<&H264Parameters>) -> Self {
        Self {
            medias: vec![Media {
                media_type: MediaType::Video,
                control: None,
                formats: vec![Format::H264(H264Format {
                    payload_type: H264_PAYLOAD_TYPE,
                    packetization_mode: 1,
                    sps: params.map(|p| p.sps.clone()),
                    pps: params.map(|p| p.pps.clone()),
                })],
            }],
        }
    }

    /// First video media carrying H.264, with its index.
    pub fn find_h264_media(&self) -> Option<(usize, &Media)> {
        self.medias
            .iter()
            .enumerate()
            .find(|(_, m)| m.media_type == MediaType::Video && m.h264().is_some())
    }

    pub fn find_h264(&self) -> Option<&H264Format> {
        self.find_h264_media().and_then(|(_, m)| m.h264())
    }
}

/// Where a reader's packets go.
#[derive(Debug, Clone)]
pub enum ReaderOutput {
    Udp { rtp: SocketAddr },
    Multicast,
    /// `$`-framed on the reader's RTSP connection.
    Interleaved { channel: u8, queue: SyncSender<Vec<u8>> },
}

#[derive(Debug)]
struct Reader {
    output: ReaderOutput,
    playing: AtomicBool,
    awaiting_keyframe: AtomicBool,
}

/// Options fixed at stream creation.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Hold back packets from a newly playing reader until a keyframe.
    pub wait_for_keyframe: bool,
    pub multicast: Option<MulticastGroup>,
}

/// The active stream: description plus reader fan-out.
///
/// Packets arrive from the pacing thread through [`PacketSink`] or from a
/// publisher through [`forward`](Self::forward); both may run concurrently.
pub struct SharedStream {
    description: StreamDescription,
    udp: Arc<UdpTransport>,
    options: StreamOptions,
    readers: RwLock<HashMap<String, Reader>>,
    /// Sequence number and timestamp of the last distributed packet.
    last_packet: Mutex<Option<(u16, u32)>>,
    closed: AtomicBool,
}

impl SharedStream {
    pub fn new(description: StreamDescription, udp: Arc<UdpTransport>, options: StreamOptions) -> Self {
        Self {
            description,
            udp,
            options,
            readers: RwLock::new(HashMap::new()),
            last_packet: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn description(&self) -> &StreamDescription {
        &self.description
    }

    pub fn multicast_group(&self) -> Option<MulticastGroup> {
        self.options.multicast
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Attach a reader. It receives nothing until [`set_playing`](Self::set_playing).
    pub fn add_reader(&self, session_id: &str, output: ReaderOutput) -> Result<()> {
        if self.is_closed() {
            return Err(RtspError::StreamClosed);
        }
        tracing::debug!(session_id, ?output, "reader attached");
        self.readers.write().insert(
            session_id.to_string(),
            Reader {
                output,
                playing: AtomicBool::new(false),
                awaiting_keyframe: AtomicBool::new(false),
            },
        );
        Ok(())
    }

    pub fn remove_reader(&self, session_id: &str) {
        if self.readers.write().remove(session_id).is_some() {
            tracing::debug!(session_id, "reader detached");
        }
    }

    pub fn reader_count(&self) -> usize {
        self.readers.read().len()
    }

    /// Start or stop delivery to a reader.
    pub fn set_playing(&self, session_id: &str, playing: bool) -> Result<()> {
        if self.is_closed() {
            return Err(RtspError::StreamClosed);
        }
        let readers = self.readers.read();
        let reader = readers
            .get(session_id)
            .ok_or_else(|| RtspError::SessionNotFound(session_id.to_string()))?;
        if playing && !reader.playing.load(Ordering::SeqCst) {
            reader
                .awaiting_keyframe
                .store(self.options.wait_for_keyframe, Ordering::SeqCst);
        }
        reader.playing.store(playing, Ordering::SeqCst);
        Ok(())
    }

    /// `(next sequence, last timestamp)` for the RTP-Info header.
    pub fn rtp_info(&self) -> Option<(u16, u32)> {
        self.last_packet
            .lock()
            .map(|(seq, ts)| (seq.wrapping_add(1), ts))
    }

    /// Republish a packet received from a publisher, unmodified.
    pub fn forward(&self, raw: &[u8]) -> Result<()> {
        let view = RtpView::parse(raw)?;
        let keyframe = h264::starts_keyframe(view.payload);
        self.distribute(raw, view.sequence, view.timestamp, keyframe)
    }

    /// Stop accepting packets and drop every reader.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let readers = std::mem::take(&mut *self.readers.write());
            tracing::info!(readers = readers.len(), "stream closed");
        }
    }

    fn distribute(&self, raw: &[u8], sequence: u16, timestamp: u32, keyframe: bool) -> Result<()> {
        if self.is_closed() {
            return Err(RtspError::StreamClosed);
        }
        *self.last_packet.lock() = Some((sequence, timestamp));

        let mut multicast = false;
        let readers = self.readers.read();
        for (session_id, reader) in readers.iter() {
            if !reader.playing.load(Ordering::Relaxed) {
                continue;
            }
            if reader.awaiting_keyframe.load(Ordering::Relaxed) {
                if !keyframe {
                    continue;
                }
                reader.awaiting_keyframe.store(false, Ordering::Relaxed);
                tracing::debug!(session_id, "keyframe reached, delivery started");
            }
            match &reader.output {
                ReaderOutput::Udp { rtp } => {
                    if let Err(e) = self.udp.send_to(raw, *rtp) {
                        tracing::trace!(session_id, error = %e, "UDP send failed");
                    }
                }
                ReaderOutput::Multicast => multicast = true,
                ReaderOutput::Interleaved { channel, queue } => {
                    match queue.try_send(interleaved_frame(*channel, raw)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::trace!(session_id, "interleaved queue full, packet dropped");
                        }
                        Err(TrySendError::Disconnected(_)) => {}
                    }
                }
            }
        }
        drop(readers);

        if multicast && let Some(group) = self.options.multicast {
            if let Err(e) = self.udp.send_to(raw, group.rtp_destination()) {
                tracing::trace!(group = %group.addr, error = %e, "multicast send failed");
            }
        }
        Ok(())
    }
}

impl PacketSink for SharedStream {
    fn write_packet(&self, packet: &RtpPacket) -> Result<()> {
        let keyframe = h264::starts_keyframe(&packet.payload);
        self.distribute(&packet.marshal(), packet.sequence, packet.timestamp, keyframe)
    }
}

/// RFC 2326 §10.12 interleaved frame: `$`, channel, 16-bit length, data.
pub fn interleaved_frame(channel: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.push(b'$');
    frame.push(channel);
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(data);
    frame
}

/// Identity of the session allowed to write to the stream, and the switch
/// that disconnects it.
#[derive(Debug, Clone)]
pub struct Publisher {
    pub session_id: String,
    pub disconnect: Arc<AtomicBool>,
}

/// Contents of the stream slot.
#[derive(Default)]
pub struct StreamSlot {
    stream: Option<Arc<SharedStream>>,
    publisher: Option<Publisher>,
}

impl StreamSlot {
    pub fn stream(&self) -> Option<&Arc<SharedStream>> {
        self.stream.as_ref()
    }

    pub fn publisher(&self) -> Option<&Publisher> {
        self.publisher.as_ref()
    }

    /// Install `stream`, closing any previous one and disconnecting its
    /// publisher.
    pub fn replace(&mut self, stream: Arc<SharedStream>, publisher: Option<Publisher>) {
        let previous = self.publisher.take();
        self.clear();
        if let Some(old) = previous {
            let same_connection = publisher
                .as_ref()
                .is_some_and(|new| Arc::ptr_eq(&new.disconnect, &old.disconnect));
            if !same_connection {
                tracing::info!(session_id = %old.session_id, "preempting previous publisher");
                old.disconnect.store(true, Ordering::SeqCst);
            }
        }
        self.stream = Some(stream);
        self.publisher = publisher;
    }

    pub fn clear(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.publisher = None;
    }
}

/// Access-controlled handle to the single active stream.
#[derive(Clone, Default)]
pub struct StreamHandle {
    slot: Arc<RwLock<StreamSlot>>,
}

impl StreamHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The active stream, if any.
    pub fn current(&self) -> Option<Arc<SharedStream>> {
        self.slot
            .read()
            .stream
            .as_ref()
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Exclusive access for multi-step initialization. Requests that need
    /// the stream block until the guard drops.
    pub fn write(&self) -> RwLockWriteGuard<'_, StreamSlot> {
        self.slot.write()
    }

    pub fn publish(&self, stream: Arc<SharedStream>, publisher: Option<Publisher>) {
        self.slot.write().replace(stream, publisher);
    }

    /// Tear the stream down if `session_id` is its publisher.
    pub fn close_publisher(&self, session_id: &str) -> bool {
        let mut slot = self.slot.write();
        if slot
            .publisher
            .as_ref()
            .is_some_and(|p| p.session_id == session_id)
        {
            tracing::info!(session_id, "publisher left, closing stream");
            slot.clear();
            return true;
        }
        false
    }

    /// Tear the stream down if it is still `stream`.
    pub fn close_if_current(&self, stream: &Arc<SharedStream>) -> bool {
        let mut slot = self.slot.write();
        if slot.stream.as_ref().is_some_and(|s| Arc::ptr_eq(s, stream)) {
            slot.clear();
            return true;
        }
        stream.close();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpHeader;
    use std::net::UdpSocket;
    use std::sync::mpsc;
    use std::time::Duration;

    fn udp() -> Arc<UdpTransport> {
        UdpTransport::bind("127.0.0.1:0", "127.0.0.1:0").unwrap()
    }

    fn stream(options: StreamOptions) -> Arc<SharedStream> {
        Arc::new(SharedStream::new(StreamDescription::h264(None), udp(), options))
    }

    fn packet(header: &mut RtpHeader, payload: &[u8]) -> RtpPacket {
        let mut p = header.packet(true, payload.to_vec());
        p.timestamp = 9_000;
        p
    }

    #[test]
    fn description_finds_h264() {
        let desc = StreamDescription::h264(Some(&H264Parameters {
            sps: vec![0x67, 1],
            pps: vec![0x68, 2],
        }));
        let format = desc.find_h264().unwrap();
        assert_eq!(format.payload_type, 96);
        assert!(format.parameters().is_some());

        let other = StreamDescription {
            medias: vec![Media {
                media_type: MediaType::Video,
                control: None,
                formats: vec![Format::Other {
                    payload_type: 26,
                    rtpmap: None,
                    fmtp: None,
                }],
            }],
        };
        assert!(other.find_h264().is_none());
    }

    #[test]
    fn interleaved_reader_receives_only_while_playing() {
        let stream = stream(StreamOptions::default());
        let (tx, rx) = mpsc::sync_channel(8);
        stream
            .add_reader("r1", ReaderOutput::Interleaved { channel: 2, queue: tx })
            .unwrap();
        let mut header = RtpHeader::new(96, 1);

        stream.write_packet(&packet(&mut header, &[0x41, 1])).unwrap();
        assert!(rx.try_recv().is_err());

        stream.set_playing("r1", true).unwrap();
        let sent = packet(&mut header, &[0x41, 2]);
        stream.write_packet(&sent).unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(&frame[..2], &[b'$', 2]);
        assert_eq!(&frame[4..], &sent.marshal()[..]);
        assert_eq!(stream.rtp_info(), Some((sent.sequence.wrapping_add(1), 9_000)));
    }

    #[test]
    fn keyframe_gating_holds_back_until_idr() {
        let stream = stream(StreamOptions {
            wait_for_keyframe: true,
            multicast: None,
        });
        let (tx, rx) = mpsc::sync_channel(8);
        stream
            .add_reader("r1", ReaderOutput::Interleaved { channel: 0, queue: tx })
            .unwrap();
        stream.set_playing("r1", true).unwrap();
        let mut header = RtpHeader::new(96, 1);

        stream.write_packet(&packet(&mut header, &[0x41, 1])).unwrap();
        assert!(rx.try_recv().is_err());
        stream.write_packet(&packet(&mut header, &[0x65, 1])).unwrap();
        stream.write_packet(&packet(&mut header, &[0x41, 2])).unwrap();
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn udp_reader_receives_datagrams() {
        let stream = stream(StreamOptions::default());
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        stream
            .add_reader("r1", ReaderOutput::Udp { rtp: client.local_addr().unwrap() })
            .unwrap();
        stream.set_playing("r1", true).unwrap();

        let mut header = RtpHeader::new(96, 7);
        let sent = packet(&mut header, &[0x65, 0xaa]);
        stream.write_packet(&sent).unwrap();
        let mut buf = [0u8; 64];
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &sent.marshal()[..]);
    }

    #[test]
    fn forward_rejects_non_rtp() {
        let stream = stream(StreamOptions::default());
        assert!(matches!(
            stream.forward(&[1, 2, 3]),
            Err(RtspError::InvalidPacket(_))
        ));
    }

    #[test]
    fn closed_stream_refuses_packets_and_readers() {
        let stream = stream(StreamOptions::default());
        let (tx, _rx) = mpsc::sync_channel(1);
        stream
            .add_reader("r1", ReaderOutput::Interleaved { channel: 0, queue: tx.clone() })
            .unwrap();
        stream.close();
        assert_eq!(stream.reader_count(), 0);
        let mut header = RtpHeader::new(96, 1);
        assert!(matches!(
            stream.write_packet(&packet(&mut header, &[0x41])),
            Err(RtspError::StreamClosed)
        ));
        assert!(
            stream
                .add_reader("r2", ReaderOutput::Interleaved { channel: 0, queue: tx })
                .is_err()
        );
    }

    #[test]
    fn publish_preempts_previous_publisher() {
        let handle = StreamHandle::new();
        let first_kill = Arc::new(AtomicBool::new(false));
        let first = stream(StreamOptions::default());
        handle.publish(
            first.clone(),
            Some(Publisher {
                session_id: "a".into(),
                disconnect: first_kill.clone(),
            }),
        );
        assert!(handle.current().is_some());

        let second = stream(StreamOptions::default());
        handle.publish(
            second.clone(),
            Some(Publisher {
                session_id: "b".into(),
                disconnect: Arc::new(AtomicBool::new(false)),
            }),
        );
        assert!(first.is_closed());
        assert!(first_kill.load(Ordering::SeqCst));
        assert!(Arc::ptr_eq(&handle.current().unwrap(), &second));

        assert!(!handle.close_publisher("a"));
        assert!(handle.close_publisher("b"));
        assert!(handle.current().is_none());
        assert!(second.is_closed());
    }

    #[test]
    fn republish_from_same_connection_keeps_it_alive() {
        let handle = StreamHandle::new();
        let kill = Arc::new(AtomicBool::new(false));
        for id in ["a", "b"] {
            handle.publish(
                stream(StreamOptions::default()),
                Some(Publisher {
                    session_id: id.into(),
                    disconnect: kill.clone(),
                }),
            );
        }
        assert!(!kill.load(Ordering::SeqCst));
    }

    #[test]
    fn stale_stream_close_leaves_current_alone() {
        let handle = StreamHandle::new();
        let old = stream(StreamOptions::default());
        handle.publish(old.clone(), None);
        let new = stream(StreamOptions::default());
        handle.publish(new.clone(), None);
        assert!(!handle.close_if_current(&old));
        assert!(!new.is_closed());
        assert!(handle.close_if_current(&new));
        assert!(handle.current().is_none());
    }
}
