use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::{Result, RtspError};
use crate::media::h264::H264Packetizer;
use crate::media::params::ParameterExtractor;
use crate::pacing::{Pacer, Pipeline};
use crate::session::SessionManager;
use crate::session::DEFAULT_SESSION_TIMEOUT_SECS;
use crate::source::{SourceConfig, SourceReader};
use crate::stream::{H264_PAYLOAD_TYPE, SharedStream, StreamDescription, StreamHandle, StreamOptions};
use crate::transport::tcp;
use crate::transport::{MulticastConfig, UdpTransport};

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// RTSP listen address.
    pub rtsp_address: String,
    /// UDP RTP socket address.
    pub udp_rtp_address: String,
    /// UDP RTCP socket address.
    pub udp_rtcp_address: String,
    pub multicast: MulticastConfig,
    /// Serve RTSP over TLS when set.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Hold back a new reader's packets until the next keyframe.
    pub wait_for_keyframe: bool,
    /// Advertised in the `Session` header.
    pub session_timeout_secs: u64,
    /// Interleaved frames buffered per connection before packets are dropped.
    pub interleaved_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rtsp_address: "0.0.0.0:8554".to_string(),
            udp_rtp_address: "0.0.0.0:8000".to_string(),
            udp_rtcp_address: "0.0.0.0:8001".to_string(),
            multicast: MulticastConfig::default(),
            tls: None,
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            wait_for_keyframe: false,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            interleaved_queue_depth: 512,
        }
    }
}

/// Everything a connection needs, shared across all connections.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub sessions: SessionManager,
    pub stream: StreamHandle,
    pub udp: Arc<UdpTransport>,
}

/// High-level RTSP server orchestrator.
///
/// Owns the session manager, the stream slot, and the UDP transport.
/// Delegates TCP connection handling to [`transport::tcp`](crate::transport::tcp)
/// and media distribution to [`SharedStream`].
pub struct Server {
    session_manager: SessionManager,
    stream: StreamHandle,
    running: Arc<AtomicBool>,
    udp: Option<Arc<UdpTransport>>,
    local_addr: Option<SocketAddr>,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            session_manager: SessionManager::with_timeout(config.session_timeout_secs),
            stream: StreamHandle::new(),
            running: Arc::new(AtomicBool::new(false)),
            udp: None,
            local_addr: None,
            config: Arc::new(config),
        }
    }

    /// Bind the RTSP listener and UDP sockets, then spawn the accept and
    /// UDP ingress threads.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let udp = UdpTransport::bind(&self.config.udp_rtp_address, &self.config.udp_rtcp_address)?;

        let listener = TcpListener::bind(&self.config.rtsp_address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        udp.spawn_ingress(self.running.clone())?;

        let state = ServerState {
            config: self.config.clone(),
            sessions: self.session_manager.clone(),
            stream: self.stream.clone(),
            udp: udp.clone(),
        };
        let running = self.running.clone();

        tracing::info!(
            addr = %local_addr,
            tls = self.config.tls.is_some(),
            "RTSP server listening"
        );

        thread::spawn(move || {
            tcp::accept_loop(listener, state, running);
        });

        self.udp = Some(udp);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.stream.write().clear();
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound RTSP address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bound UDP (RTP, RTCP) ports, once started.
    pub fn udp_ports(&self) -> Option<(u16, u16)> {
        self.udp.as_ref().map(|udp| udp.server_ports())
    }

    /// Serve a file or pipe as the active stream.
    ///
    /// Parameter extraction, opening the source and installing the stream
    /// all happen under the stream's write lock, so no client observes a
    /// half-initialized stream. The returned thread paces the source until
    /// the stream is torn down or the source fails.
    pub fn publish_file(&self, path: &Path, source: &SourceConfig) -> Result<JoinHandle<()>> {
        let udp = self.udp.clone().ok_or(RtspError::NotStarted)?;
        let mut slot = self.stream.write();

        let extractor = ParameterExtractor::new(source.tools.clone(), source.probe);
        let params = match extractor.extract(path) {
            Ok(params) => {
                tracing::info!(
                    path = %path.display(),
                    profile_level_id = params.profile_level_id().as_deref().unwrap_or("unknown"),
                    "parameter sets found"
                );
                Some(params)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "announcing without parameter sets");
                None
            }
        };

        let mut reader = SourceReader::open(path, source)?;
        let stream = Arc::new(SharedStream::new(
            StreamDescription::h264(params.as_ref()),
            udp,
            StreamOptions {
                wait_for_keyframe: self.config.wait_for_keyframe,
                multicast: Some(self.config.multicast.allocate()),
            },
        ));
        slot.replace(stream.clone(), None);
        drop(slot);

        let handle = self.stream.clone();
        let path: PathBuf = path.to_path_buf();
        let pipeline = Pipeline::new(
            Box::new(H264Packetizer::with_random_ssrc(H264_PAYLOAD_TYPE)),
            Pacer::with_random_base(),
            stream.clone(),
        )
        .with_parameters(params);

        let thread = thread::Builder::new()
            .name("pacing".into())
            .spawn(move || {
                tracing::info!(path = %path.display(), kind = ?reader.kind(), "pacing started");
                if let Err(e) = pipeline.run(&mut reader) {
                    tracing::error!(path = %path.display(), error = %e, "source failed, closing stream");
                }
                handle.close_if_current(&stream);
            })?;
        Ok(thread)
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    /// Handle to the active stream.
    pub fn stream_handle(&self) -> StreamHandle {
        self.stream.clone()
    }

    /// Returns the server's protocol configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
