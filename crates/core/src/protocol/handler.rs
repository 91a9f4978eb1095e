use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::SyncSender;

use crate::error::RtspError;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::{self, SdpOrigin};
use crate::server::ServerState;
use crate::session::transport::{RequestedDelivery, TransportHeader};
use crate::session::{Session, SessionRole, SessionState, Transport};
use crate::stream::{Publisher, ReaderOutput, SharedStream, StreamDescription, StreamOptions};

const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, PAUSE, RECORD, TEARDOWN, GET_PARAMETER";

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection so they
/// can be cleaned up when the connection drops.
pub struct MethodHandler {
    state: ServerState,
    client_addr: SocketAddr,
    /// Queue drained by the connection loop; carries `$` frames to this client.
    outbound: SyncSender<Vec<u8>>,
    /// Set when another publisher takes over; the connection loop then exits.
    disconnect: Arc<AtomicBool>,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
    /// The publishing session on this connection, if any.
    publisher: Option<Arc<Session>>,
}

impl MethodHandler {
    pub fn new(
        state: ServerState,
        client_addr: SocketAddr,
        outbound: SyncSender<Vec<u8>>,
        disconnect: Arc<AtomicBool>,
    ) -> Self {
        MethodHandler {
            state,
            client_addr,
            outbound,
            disconnect,
            session_ids: Vec::new(),
            publisher: None,
        }
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => self.handle_describe(cseq, &request.uri),
            "ANNOUNCE" => self.handle_announce(cseq, request),
            "SETUP" => self.handle_setup(cseq, request),
            "PLAY" => self.handle_play(cseq, request),
            "PAUSE" => self.handle_pause(cseq, request),
            "RECORD" => self.handle_record(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            "GET_PARAMETER" => self.handle_get_parameter(cseq, request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented().add_header("CSeq", cseq)
            }
        }
    }

    /// Forward an interleaved frame from a recording publisher.
    ///
    /// Frames on any other channel (RTCP, untracked media) are dropped.
    pub fn handle_interleaved(&mut self, channel: u8, payload: &[u8]) {
        let Some(session) = &self.publisher else {
            tracing::trace!(channel, "interleaved frame without a publisher");
            return;
        };
        if session.get_state() != SessionState::Recording {
            return;
        }
        let Some(Transport::Interleaved { rtp_channel, .. }) = session.get_transport() else {
            return;
        };
        if channel != rtp_channel {
            return;
        }
        let Some(stream) = session.stream() else {
            return;
        };
        match stream.forward(payload) {
            Ok(()) | Err(RtspError::StreamClosed) => {}
            Err(e) => tracing::debug!(session_id = %session.id, error = %e, "dropping publisher packet"),
        }
    }

    /// Close every session this connection created.
    pub fn close_all(&mut self) -> usize {
        let ids = std::mem::take(&mut self.session_ids);
        let removed = self.state.sessions.remove_sessions(&ids);
        for session in &removed {
            self.close_session(session);
        }
        self.publisher = None;
        removed.len()
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", PUBLIC_METHODS)
    }

    /// Parses host from an RTSP URI (e.g. rtsp://host:8554/path -> host). Falls back to client IP if invalid.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.state.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let Some(stream) = self.state.stream.current() else {
            tracing::info!(uri, "DESCRIBE with no active stream");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let host = self.host_from_uri_or_client(uri);
        let config = &self.state.config;
        let sdp = sdp::generate_sdp(
            stream.description(),
            &SdpOrigin {
                ip: &host,
                username: &config.sdp_username,
                session_id: &config.sdp_session_id,
                session_version: &config.sdp_session_version,
                session_name: &config.sdp_session_name,
            },
        );

        let base = if uri.ends_with('/') {
            uri.to_string()
        } else {
            format!("{uri}/")
        };
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &base)
            .with_body(sdp)
    }

    fn handle_announce(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let description = match sdp::parse_sdp(&request.body) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(%cseq, error = %e, "ANNOUNCE with invalid SDP");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };
        let Some((_, media)) = description.find_h264_media() else {
            tracing::warn!(%cseq, medias = description.medias.len(), "ANNOUNCE without H.264 video");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        // Only the H.264 track is relayed.
        let description = StreamDescription {
            medias: vec![media.clone()],
        };

        if let Some(previous) = self.publisher.take() {
            self.session_ids.retain(|id| id != &previous.id);
            if let Some(previous) = self.state.sessions.remove_session(&previous.id) {
                self.close_session(&previous);
            }
        }

        let session = self.state.sessions.create_session(SessionRole::Publisher);
        let stream = Arc::new(SharedStream::new(
            description,
            self.state.udp.clone(),
            self.stream_options(),
        ));
        session.attach_stream(stream.clone());
        self.state.stream.publish(
            stream,
            Some(Publisher {
                session_id: session.id.clone(),
                disconnect: self.disconnect.clone(),
            }),
        );
        self.session_ids.push(session.id.clone());
        self.publisher = Some(session.clone());

        tracing::info!(session_id = %session.id, uri = %request.uri, peer = %self.client_addr, "publisher announced");

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        let Some(requested) = TransportHeader::parse(transport_header) else {
            tracing::warn!(%cseq, transport_header, "SETUP with unsupported Transport header");
            return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
        };

        let existing = match request.session_id() {
            Some(id) => match self.state.sessions.get_session(id) {
                Some(session) => Some(session),
                None => {
                    tracing::warn!(session_id = id, "SETUP for unknown session");
                    return RtspResponse::session_not_found().add_header("CSeq", cseq);
                }
            },
            None => None,
        };

        match existing {
            Some(session) if session.role == SessionRole::Publisher => {
                self.setup_publisher(cseq, request, &session, requested.delivery)
            }
            existing => self.setup_reader(cseq, existing, requested.delivery),
        }
    }

    fn setup_publisher(
        &mut self,
        cseq: &str,
        request: &RtspRequest,
        session: &Session,
        delivery: RequestedDelivery,
    ) -> RtspResponse {
        if !matches!(
            session.get_state(),
            SessionState::Announced | SessionState::PreRecord
        ) {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }
        let transport = match delivery {
            RequestedDelivery::Multicast => {
                tracing::warn!(session_id = %session.id, "publisher requested multicast");
                return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
            }
            RequestedDelivery::Udp {
                rtp_port,
                rtcp_port,
            } => Transport::Udp {
                client_rtp: SocketAddr::new(self.client_addr.ip(), rtp_port),
                client_rtcp: SocketAddr::new(self.client_addr.ip(), rtcp_port),
            },
            RequestedDelivery::Interleaved { channels } => {
                let (rtp_channel, rtcp_channel) = channels.unwrap_or((0, 1));
                Transport::Interleaved {
                    rtp_channel,
                    rtcp_channel,
                }
            }
        };

        let video_track = session.stream().is_some_and(|stream| {
            stream
                .description()
                .medias
                .first()
                .is_some_and(|m| targets_control(&request.uri, m.control.as_deref()))
        });
        if video_track {
            session.set_transport(transport.clone());
        } else {
            tracing::debug!(session_id = %session.id, uri = %request.uri, "ignoring non-video track");
        }
        session.set_state(SessionState::PreRecord);

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header(
                "Transport",
                &transport.header_value(self.state.udp.server_ports(), true),
            )
            .add_header("Session", &session.session_header_value())
    }

    fn setup_reader(
        &mut self,
        cseq: &str,
        existing: Option<Arc<Session>>,
        delivery: RequestedDelivery,
    ) -> RtspResponse {
        if let Some(session) = &existing
            && matches!(session.get_state(), SessionState::Playing)
        {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        let Some(stream) = self.state.stream.current() else {
            tracing::info!(%cseq, "SETUP with no active stream");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let (transport, output) = match delivery {
            RequestedDelivery::Udp {
                rtp_port,
                rtcp_port,
            } => {
                let client_rtp = SocketAddr::new(self.client_addr.ip(), rtp_port);
                (
                    Transport::Udp {
                        client_rtp,
                        client_rtcp: SocketAddr::new(self.client_addr.ip(), rtcp_port),
                    },
                    ReaderOutput::Udp { rtp: client_rtp },
                )
            }
            RequestedDelivery::Interleaved { channels } => {
                let (rtp_channel, rtcp_channel) = channels.unwrap_or((0, 1));
                (
                    Transport::Interleaved {
                        rtp_channel,
                        rtcp_channel,
                    },
                    ReaderOutput::Interleaved {
                        channel: rtp_channel,
                        queue: self.outbound.clone(),
                    },
                )
            }
            RequestedDelivery::Multicast => {
                let Some(group) = stream.multicast_group() else {
                    return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
                };
                (Transport::Multicast { group }, ReaderOutput::Multicast)
            }
        };

        let session = match existing {
            Some(session) => {
                session.detach();
                session
            }
            None => {
                let session = self.state.sessions.create_session(SessionRole::Reader);
                self.session_ids.push(session.id.clone());
                session
            }
        };

        if stream.add_reader(&session.id, output).is_err() {
            return RtspResponse::not_found().add_header("CSeq", cseq);
        }
        session.attach_stream(stream);
        session.set_transport(transport.clone());
        session.set_state(SessionState::Ready);

        tracing::info!(
            session_id = %session.id,
            peer = %self.client_addr,
            ?transport,
            "reader set up"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header(
                "Transport",
                &transport.header_value(self.state.udp.server_ports(), false),
            )
            .add_header("Session", &session.session_header_value())
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.lookup_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };
        if session.role == SessionRole::Publisher {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        let Some(stream) = session.stream().filter(|s| !s.is_closed()) else {
            tracing::info!(session_id = %session.id, "PLAY on a torn-down stream");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };
        if stream.set_playing(&session.id, true).is_err() {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        }
        session.set_state(SessionState::Playing);
        tracing::info!(session_id = %session.id, "session started playing");

        let mut resp = RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-");

        if let Some((seq, rtptime)) = stream.rtp_info() {
            let url = format!(
                "{}/{}",
                request.uri.trim_end_matches('/'),
                sdp::track_control(0)
            );
            resp = resp.add_header("RTP-Info", &format!("url={url};seq={seq};rtptime={rtptime}"));
        }

        resp
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.lookup_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };
        if session.role == SessionRole::Publisher {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        if let Some(stream) = session.stream() {
            // A torn-down stream has nothing left to pause.
            let _ = stream.set_playing(&session.id, false);
        }
        session.set_state(SessionState::Paused);
        tracing::info!(session_id = %session.id, "session paused");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_record(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.lookup_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };
        if session.role != SessionRole::Publisher || session.get_state() != SessionState::PreRecord {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }
        let Some(stream) = session.stream().filter(|s| !s.is_closed()) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if let Some(Transport::Udp { client_rtp, .. }) = session.get_transport() {
            self.state.udp.register_publisher(client_rtp, &session.id, stream);
        }
        session.set_state(SessionState::Recording);
        tracing::info!(session_id = %session.id, transport = ?session.get_transport(), "publisher recording");

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "TEARDOWN missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        match self.state.sessions.remove_session(session_id) {
            Some(session) => {
                self.close_session(&session);
                self.session_ids.retain(|id| id != session_id);
                if self.publisher.as_ref().is_some_and(|p| p.id == session_id) {
                    self.publisher = None;
                }
                tracing::info!(session_id, "session terminated via TEARDOWN");
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            None => {
                tracing::warn!(session_id, "TEARDOWN for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);

        if let Some(id) = request.session_id()
            && self.state.sessions.get_session(id).is_some()
        {
            resp = resp.add_header("Session", id);
        }

        resp
    }

    fn lookup_session(&self, request: &RtspRequest) -> Option<Arc<Session>> {
        let Some(id) = request.session_id() else {
            tracing::warn!(method = %request.method, "missing Session header");
            return None;
        };
        let session = self.state.sessions.get_session(id);
        if session.is_none() {
            tracing::warn!(method = %request.method, session_id = id, "unknown session");
        }
        session
    }

    /// Release what a removed session holds. A publisher takes its stream
    /// down with it; a reader only detaches.
    fn close_session(&self, session: &Session) {
        if session.role == SessionRole::Publisher {
            if let Some(Transport::Udp { client_rtp, .. }) = session.get_transport() {
                self.state.udp.unregister_publisher(client_rtp, &session.id);
            }
            self.state.stream.close_publisher(&session.id);
        }
        session.detach();
    }

    fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            wait_for_keyframe: self.state.config.wait_for_keyframe,
            multicast: Some(self.state.config.multicast.allocate()),
        }
    }
}

/// Whether a SETUP URI addresses the media with the given `a=control`.
fn targets_control(uri: &str, control: Option<&str>) -> bool {
    match control {
        None | Some("*") | Some("") => true,
        Some(control) if control.contains("://") => uri.trim_end_matches('/') == control.trim_end_matches('/'),
        Some(control) => uri.trim_end_matches('/').ends_with(control.trim_end_matches('/')),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;
    use crate::session::SessionManager;
    use crate::stream::StreamHandle;
    use crate::transport::UdpTransport;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc::{self, Receiver};

    const H264_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=live\r\n\
                            m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n\
                            a=fmtp:96 packetization-mode=1\r\na=control:trackID=0\r\n";

    fn state() -> ServerState {
        ServerState {
            config: Arc::new(ServerConfig::default()),
            sessions: SessionManager::new(),
            stream: StreamHandle::new(),
            udp: UdpTransport::bind("127.0.0.1:0", "127.0.0.1:0").unwrap(),
        }
    }

    struct Client {
        handler: MethodHandler,
        frames: Receiver<Vec<u8>>,
        disconnect: Arc<AtomicBool>,
        cseq: u32,
    }

    impl Client {
        fn new(state: &ServerState) -> Self {
            let (tx, rx) = mpsc::sync_channel(64);
            let disconnect = Arc::new(AtomicBool::new(false));
            Self {
                handler: MethodHandler::new(
                    state.clone(),
                    "127.0.0.1:40000".parse().unwrap(),
                    tx,
                    disconnect.clone(),
                ),
                frames: rx,
                disconnect,
                cseq: 0,
            }
        }

        fn send(&mut self, method: &str, uri: &str, headers: &[(&str, &str)], body: &str) -> RtspResponse {
            self.cseq += 1;
            let mut raw = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
            for (name, value) in headers {
                raw.push_str(&format!("{name}: {value}\r\n"));
            }
            if !body.is_empty() {
                raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
            raw.push_str("\r\n");
            raw.push_str(body);
            self.handler.handle(&RtspRequest::parse(&raw).unwrap())
        }
    }

    fn header<'a>(resp: &'a RtspResponse, name: &str) -> Option<&'a str> {
        resp.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn session_of(resp: &RtspResponse) -> String {
        header(resp, "Session").unwrap().split(';').next().unwrap().to_string()
    }

    fn publish(client: &mut Client) -> String {
        let resp = client.send("ANNOUNCE", "rtsp://h/live", &[("Content-Type", "application/sdp")], H264_SDP);
        assert_eq!(resp.status_code, 200);
        let session = session_of(&resp);
        let resp = client.send(
            "SETUP",
            "rtsp://h/live/trackID=0",
            &[
                ("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record"),
                ("Session", &session),
            ],
            "",
        );
        assert_eq!(resp.status_code, 200);
        assert_eq!(
            header(&resp, "Transport"),
            Some("RTP/AVP/TCP;unicast;interleaved=0-1;mode=record")
        );
        let resp = client.send("RECORD", "rtsp://h/live", &[("Session", &session)], "");
        assert_eq!(resp.status_code, 200);
        session
    }

    fn rtp(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x80, 0xe0, 0, seq, 0, 0, 0x10, 0, 1, 2, 3, 4];
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn options_lists_all_methods() {
        let mut client = Client::new(&state());
        let resp = client.send("OPTIONS", "rtsp://h/", &[], "");
        assert_eq!(header(&resp, "Public"), Some(PUBLIC_METHODS));
        assert!(PUBLIC_METHODS.contains("ANNOUNCE") && PUBLIC_METHODS.contains("RECORD"));
    }

    #[test]
    fn describe_without_stream_is_not_found() {
        let mut client = Client::new(&state());
        assert_eq!(client.send("DESCRIBE", "rtsp://h/live", &[], "").status_code, 404);
        let resp = client.send(
            "SETUP",
            "rtsp://h/live/trackID=0",
            &[("Transport", "RTP/AVP;unicast;client_port=5000-5001")],
            "",
        );
        assert_eq!(resp.status_code, 404);
    }

    #[test]
    fn announce_rejects_sdp_without_h264() {
        let state = state();
        let mut client = Client::new(&state);
        let body = "v=0\r\ns=x\r\nm=audio 0 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        assert_eq!(client.send("ANNOUNCE", "rtsp://h/live", &[], body).status_code, 400);
        assert!(state.stream.current().is_none());
        assert!(state.sessions.is_empty());
    }

    #[test]
    fn publisher_packets_reach_interleaved_reader() {
        let state = state();
        let mut publisher = Client::new(&state);
        publish(&mut publisher);

        let mut reader = Client::new(&state);
        let resp = reader.send("DESCRIBE", "rtsp://h/live", &[], "");
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body.as_deref().unwrap().matches("m=video").count(), 1);

        let resp = reader.send(
            "SETUP",
            "rtsp://h/live/trackID=0",
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=4-5")],
            "",
        );
        assert_eq!(resp.status_code, 200);
        let session = session_of(&resp);
        assert_eq!(
            reader.send("PLAY", "rtsp://h/live", &[("Session", &session)], "").status_code,
            200
        );

        let packet = rtp(7, &[0x65, 0x88]);
        publisher.handler.handle_interleaved(1, &packet);
        assert!(reader.frames.try_recv().is_err(), "RTCP channel is not forwarded");
        publisher.handler.handle_interleaved(0, &packet);
        let frame = reader.frames.try_recv().unwrap();
        assert_eq!(&frame[..4], &[b'$', 4, 0, packet.len() as u8]);
        assert_eq!(&frame[4..], &packet[..]);

        let resp = reader.send("PLAY", "rtsp://h/live", &[("Session", &session)], "");
        assert_eq!(header(&resp, "RTP-Info"), Some("url=rtsp://h/live/trackID=0;seq=8;rtptime=4096"));
    }

    #[test]
    fn second_announce_preempts_first() {
        let state = state();
        let mut first = Client::new(&state);
        publish(&mut first);
        let mut reader = Client::new(&state);
        let resp = reader.send(
            "SETUP",
            "rtsp://h/live/trackID=0",
            &[("Transport", "RTP/AVP/TCP;interleaved=0-1")],
            "",
        );
        let reader_session = session_of(&resp);

        let mut second = Client::new(&state);
        publish(&mut second);
        assert!(first.disconnect.load(Ordering::SeqCst));
        assert!(!second.disconnect.load(Ordering::SeqCst));

        let resp = reader.send("PLAY", "rtsp://h/live", &[("Session", &reader_session)], "");
        assert_eq!(resp.status_code, 454);

        // The preempted publisher's late packets go nowhere.
        let mut late_reader = Client::new(&state);
        let resp = late_reader.send(
            "SETUP",
            "rtsp://h/live/trackID=0",
            &[("Transport", "RTP/AVP/TCP;interleaved=0-1")],
            "",
        );
        let session = session_of(&resp);
        late_reader.send("PLAY", "rtsp://h/live", &[("Session", &session)], "");
        first.handler.handle_interleaved(0, &rtp(1, &[0x41]));
        assert!(late_reader.frames.try_recv().is_err());
        second.handler.handle_interleaved(0, &rtp(2, &[0x41]));
        assert!(late_reader.frames.try_recv().is_ok());
    }

    fn publish_udp(client: &mut Client) -> String {
        let resp = client.send("ANNOUNCE", "rtsp://h/live", &[("Content-Type", "application/sdp")], H264_SDP);
        let session = session_of(&resp);
        let resp = client.send(
            "SETUP",
            "rtsp://h/live/trackID=0",
            &[
                ("Transport", "RTP/AVP;unicast;client_port=6000-6001;mode=record"),
                ("Session", &session),
            ],
            "",
        );
        assert_eq!(resp.status_code, 200);
        let resp = client.send("RECORD", "rtsp://h/live", &[("Session", &session)], "");
        assert_eq!(resp.status_code, 200);
        session
    }

    #[test]
    fn preempted_udp_publisher_keeps_replacement_route() {
        let state = state();
        let source: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let mut first = Client::new(&state);
        let first_session = publish_udp(&mut first);
        assert_eq!(state.udp.publisher_session(source), Some(first_session));

        let mut second = Client::new(&state);
        let second_session = publish_udp(&mut second);
        assert!(first.disconnect.load(Ordering::SeqCst));

        first.handler.close_all();
        assert_eq!(state.udp.publisher_session(source), Some(second_session));
        assert!(state.stream.current().is_some());

        second.handler.close_all();
        assert_eq!(state.udp.publisher_session(source), None);
    }

    #[test]
    fn publisher_disconnect_tears_down_stream() {
        let state = state();
        let mut publisher = Client::new(&state);
        publish(&mut publisher);
        assert!(state.stream.current().is_some());
        assert_eq!(publisher.handler.close_all(), 1);
        assert!(state.stream.current().is_none());
    }

    #[test]
    fn reader_teardown_leaves_stream() {
        let state = state();
        let mut publisher = Client::new(&state);
        publish(&mut publisher);
        let mut reader = Client::new(&state);
        let resp = reader.send(
            "SETUP",
            "rtsp://h/live/trackID=0",
            &[("Transport", "RTP/AVP;unicast;client_port=5000-5001")],
            "",
        );
        assert_eq!(
            header(&resp, "Transport").map(|t| t.starts_with("RTP/AVP;unicast;client_port=5000-5001;server_port=")),
            Some(true)
        );
        let session = session_of(&resp);
        assert_eq!(
            reader.send("TEARDOWN", "rtsp://h/live", &[("Session", &session)], "").status_code,
            200
        );
        assert!(state.stream.current().is_some());
        assert_eq!(
            reader.send("TEARDOWN", "rtsp://h/live", &[("Session", &session)], "").status_code,
            454
        );
    }

    #[test]
    fn multicast_setup_advertises_group() {
        let state = state();
        let mut publisher = Client::new(&state);
        publish(&mut publisher);
        let mut reader = Client::new(&state);
        let resp = reader.send("SETUP", "rtsp://h/live/trackID=0", &[("Transport", "RTP/AVP;multicast")], "");
        assert_eq!(resp.status_code, 200);
        let transport = header(&resp, "Transport").unwrap();
        assert!(transport.starts_with("RTP/AVP;multicast;destination=224.1."));
        assert!(transport.ends_with(";port=8002-8003;ttl=16"));
    }

    #[test]
    fn record_requires_setup() {
        let state = state();
        let mut client = Client::new(&state);
        let resp = client.send("ANNOUNCE", "rtsp://h/live", &[], H264_SDP);
        let session = session_of(&resp);
        assert_eq!(
            client.send("RECORD", "rtsp://h/live", &[("Session", &session)], "").status_code,
            455
        );
        assert_eq!(
            client.send("RECORD", "rtsp://h/live", &[("Session", "nope")], "").status_code,
            454
        );
    }

    #[test]
    fn control_matching() {
        assert!(targets_control("rtsp://h/live/trackID=0", Some("trackID=0")));
        assert!(!targets_control("rtsp://h/live/trackID=1", Some("trackID=0")));
        assert!(targets_control("rtsp://h/live/x", None));
        assert!(targets_control("rtsp://h/live/a/", Some("rtsp://h/live/a")));
    }
}
