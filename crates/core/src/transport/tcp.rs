use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use rustls::{ServerConnection, StreamOwned};

use crate::error::Result;
use crate::protocol::MethodHandler;
use crate::protocol::message::{Message, MessageDecoder};
use crate::protocol::RtspResponse;
use crate::server::ServerState;

/// How long a connection blocks in `read` before servicing its queue.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 16 * 1024;

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(listener: TcpListener, state: ServerState, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let s = state.clone();
                let r = running.clone();
                thread::spawn(move || {
                    Connection::handle(stream, s, r);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// Plain or TLS-wrapped RTSP connection.
pub enum RtspStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl RtspStream {
    /// Wrap an accepted socket, starting a TLS session when configured.
    pub fn accept(socket: TcpStream, tls: Option<&Arc<rustls::ServerConfig>>) -> Result<Self> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        socket.set_write_timeout(Some(WRITE_TIMEOUT))?;
        socket.set_nodelay(true)?;
        Ok(match tls {
            Some(config) => {
                let conn = ServerConnection::new(config.clone())?;
                Self::Tls(Box::new(StreamOwned::new(conn, socket)))
            }
            None => Self::Plain(socket),
        })
    }
}

impl Read for RtspStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for RtspStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// A single RTSP client connection with its own lifecycle.
///
/// The connection thread is the only writer to the socket: responses and
/// queued interleaved frames are both written from [`run`](Self::run).
struct Connection {
    stream: RtspStream,
    decoder: MessageDecoder,
    handler: MethodHandler,
    outbound: Receiver<Vec<u8>>,
    disconnect: Arc<AtomicBool>,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    pub fn handle(socket: TcpStream, state: ServerState, running: Arc<AtomicBool>) {
        let peer_addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        let stream = match RtspStream::accept(socket, state.config.tls.as_ref()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "failed to set up connection");
                return;
            }
        };
        tracing::info!(%peer_addr, tls = matches!(stream, RtspStream::Tls(_)), "client connected");

        let (tx, rx) = mpsc::sync_channel(state.config.interleaved_queue_depth.max(1));
        let disconnect = Arc::new(AtomicBool::new(false));
        let handler = MethodHandler::new(state, peer_addr, tx, disconnect.clone());

        let mut conn = Connection {
            stream,
            decoder: MessageDecoder::new(),
            handler,
            outbound: rx,
            disconnect,
            peer_addr,
        };

        let reason = conn.run(&running);
        let removed = conn.handler.close_all();
        if removed > 0 {
            tracing::info!(peer = %peer_addr, removed, "cleaned up sessions on disconnect");
        }

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Request/response and interleaved loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if !running.load(Ordering::SeqCst) {
                return "server shutting down";
            }
            if self.disconnect.load(Ordering::SeqCst) {
                return "preempted by another publisher";
            }
            if self.flush_outbound().is_err() {
                return "write error";
            }

            match self.stream.read(&mut buf) {
                Ok(0) => return "connection closed by client",
                Ok(n) => self.decoder.extend(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    tracing::debug!(peer = %self.peer_addr, error = %e, "read failed");
                    return "read error";
                }
            }

            loop {
                match self.decoder.next_message() {
                    Ok(None) => break,
                    Ok(Some(Message::Interleaved { channel, payload })) => {
                        self.handler.handle_interleaved(channel, &payload);
                    }
                    Ok(Some(Message::Request(request))) => {
                        tracing::debug!(
                            peer = %self.peer_addr,
                            method = %request.method,
                            uri = %request.uri,
                            version = %request.version,
                            "request"
                        );

                        let response = self.handler.handle(&request);

                        tracing::debug!(
                            peer = %self.peer_addr,
                            status = response.status_code,
                            "response"
                        );

                        if self.write(response.serialize().as_bytes()).is_err() {
                            return "write error";
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                        let _ = self.write(RtspResponse::bad_request().serialize().as_bytes());
                        return "protocol error";
                    }
                }
            }
        }
    }

    fn flush_outbound(&mut self) -> io::Result<()> {
        let mut wrote = false;
        while let Ok(frame) = self.outbound.try_recv() {
            self.stream.write_all(&frame)?;
            wrote = true;
        }
        if wrote {
            self.stream.flush()?;
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }
}
