use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{Result, RtspError};
use crate::stream::SharedStream;

const INGRESS_POLL: Duration = Duration::from_millis(200);
const MAX_DATAGRAM: usize = 65_536;

/// Multicast address range and ports handed out to streams.
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub ttl: u32,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(224, 1, 0, 0),
            prefix_len: 16,
            rtp_port: 8002,
            rtcp_port: 8003,
            ttl: 16,
        }
    }
}

impl MulticastConfig {
    /// Parse a CIDR range such as `224.1.0.0/16`.
    pub fn parse_range(range: &str) -> Option<(Ipv4Addr, u8)> {
        let (addr, prefix) = range.split_once('/')?;
        let addr: Ipv4Addr = addr.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;
        (addr.is_multicast() && prefix <= 32).then_some((addr, prefix))
    }

    /// Pick a random group address inside the range.
    pub fn allocate(&self) -> MulticastGroup {
        let mask = u32::MAX.checked_shl(32 - self.prefix_len as u32).unwrap_or(0);
        let network = u32::from(self.network) & mask;
        let host = rand::random::<u32>() & !mask;
        MulticastGroup {
            addr: Ipv4Addr::from(network | host),
            rtp_port: self.rtp_port,
            rtcp_port: self.rtcp_port,
            ttl: self.ttl,
        }
    }
}

/// Group address and ports one stream is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastGroup {
    pub addr: Ipv4Addr,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub ttl: u32,
}

impl MulticastGroup {
    pub fn rtp_destination(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.addr, self.rtp_port))
    }
}

/// Ingress route for one UDP publisher, owned by its RTSP session.
struct PublisherRoute {
    session_id: String,
    stream: Arc<SharedStream>,
}

/// Server-side RTP/RTCP UDP sockets.
///
/// Outbound media for every UDP and multicast reader leaves through the
/// RTP socket, so clients see the advertised `server_port`. The same
/// socket receives publisher packets, which are routed by source address
/// to the stream their publisher owns.
pub struct UdpTransport {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    publishers: RwLock<HashMap<SocketAddr, PublisherRoute>>,
}

impl UdpTransport {
    /// Bind the RTP and RTCP sockets (e.g. `0.0.0.0:8000`, `0.0.0.0:8001`).
    pub fn bind(rtp_addr: &str, rtcp_addr: &str) -> Result<Arc<Self>> {
        let rtp = UdpSocket::bind(rtp_addr)?;
        let rtcp = UdpSocket::bind(rtcp_addr)?;
        if let Err(e) = rtp.set_multicast_ttl_v4(MulticastConfig::default().ttl) {
            tracing::debug!(error = %e, "could not set multicast TTL");
        }
        tracing::info!(
            rtp = %rtp.local_addr()?,
            rtcp = %rtcp.local_addr()?,
            "UDP transport bound"
        );
        Ok(Arc::new(Self {
            rtp,
            rtcp,
            publishers: RwLock::new(HashMap::new()),
        }))
    }

    /// Local (RTP, RTCP) ports, as advertised in `server_port`.
    pub fn server_ports(&self) -> (u16, u16) {
        let port = |s: &UdpSocket| s.local_addr().map(|a| a.port()).unwrap_or(0);
        (port(&self.rtp), port(&self.rtcp))
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.rtp.send_to(payload, addr)?)
    }

    /// Route RTP arriving from `source` into `stream` on behalf of
    /// `session_id`. A later registration for the same source replaces it.
    pub fn register_publisher(&self, source: SocketAddr, session_id: &str, stream: Arc<SharedStream>) {
        tracing::debug!(%source, session_id, "UDP publisher registered");
        let route = PublisherRoute {
            session_id: session_id.to_string(),
            stream,
        };
        self.publishers.write().insert(source, route);
    }

    /// Drop the route for `source` if `session_id` still owns it.
    pub fn unregister_publisher(&self, source: SocketAddr, session_id: &str) -> bool {
        let mut publishers = self.publishers.write();
        if publishers.get(&source).is_some_and(|r| r.session_id == session_id) {
            publishers.remove(&source);
            tracing::debug!(%source, session_id, "UDP publisher unregistered");
            true
        } else {
            false
        }
    }

    /// Session currently owning the route for `source`.
    pub fn publisher_session(&self, source: SocketAddr) -> Option<String> {
        self.publishers.read().get(&source).map(|r| r.session_id.clone())
    }

    fn drop_closed_route(&self, source: SocketAddr, stream: &Arc<SharedStream>) {
        let mut publishers = self.publishers.write();
        if publishers.get(&source).is_some_and(|r| Arc::ptr_eq(&r.stream, stream)) {
            publishers.remove(&source);
            tracing::debug!(%source, "UDP publisher route removed, stream closed");
        }
    }

    /// Spawn the thread forwarding publisher datagrams until `running` clears.
    pub fn spawn_ingress(self: &Arc<Self>, running: Arc<AtomicBool>) -> Result<thread::JoinHandle<()>> {
        self.rtp.set_read_timeout(Some(INGRESS_POLL))?;
        let transport = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("udp-ingress".into())
            .spawn(move || transport.ingress_loop(&running))?;
        Ok(handle)
    }

    fn ingress_loop(&self, running: &AtomicBool) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while running.load(Ordering::SeqCst) {
            let (n, source) = match self.rtp.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    // ICMP port unreachable from a departed reader surfaces here.
                    tracing::trace!(error = %e, "UDP receive error");
                    continue;
                }
            };
            let Some(stream) = self.publishers.read().get(&source).map(|r| r.stream.clone()) else {
                tracing::trace!(%source, len = n, "datagram from unknown source");
                continue;
            };
            match stream.forward(&buf[..n]) {
                Ok(()) => {}
                Err(RtspError::StreamClosed) => self.drop_closed_route(source, &stream),
                Err(e) => tracing::debug!(%source, error = %e, "dropping publisher packet"),
            }
        }
        tracing::debug!("UDP ingress loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multicast_range() {
        assert_eq!(
            MulticastConfig::parse_range("224.1.0.0/16"),
            Some((Ipv4Addr::new(224, 1, 0, 0), 16))
        );
        assert!(MulticastConfig::parse_range("10.0.0.0/8").is_none());
        assert!(MulticastConfig::parse_range("224.1.0.0").is_none());
    }

    #[test]
    fn allocates_inside_range() {
        let config = MulticastConfig::default();
        for _ in 0..32 {
            let group = config.allocate();
            let octets = group.addr.octets();
            assert_eq!(&octets[..2], &[224, 1]);
            assert_eq!(group.rtp_destination().port(), 8002);
        }
        let single = MulticastConfig {
            network: Ipv4Addr::new(239, 0, 0, 7),
            prefix_len: 32,
            ..Default::default()
        };
        assert_eq!(single.allocate().addr, Ipv4Addr::new(239, 0, 0, 7));
    }

    #[test]
    fn publisher_route_is_only_removed_by_its_owner() {
        use crate::stream::{StreamDescription, StreamOptions};

        let udp = UdpTransport::bind("127.0.0.1:0", "127.0.0.1:0").unwrap();
        let stream = |udp: &Arc<UdpTransport>| {
            Arc::new(SharedStream::new(
                StreamDescription::h264(None),
                udp.clone(),
                StreamOptions::default(),
            ))
        };
        let source: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        udp.register_publisher(source, "old", stream(&udp));
        udp.register_publisher(source, "new", stream(&udp));

        assert!(!udp.unregister_publisher(source, "old"));
        assert_eq!(udp.publisher_session(source).as_deref(), Some("new"));
        assert!(udp.unregister_publisher(source, "new"));
        assert_eq!(udp.publisher_session(source), None);
    }

    #[test]
    fn binds_ephemeral_ports() {
        let udp = UdpTransport::bind("127.0.0.1:0", "127.0.0.1:0").unwrap();
        let (rtp, rtcp) = udp.server_ports();
        assert_ne!(rtp, 0);
        assert_ne!(rtcp, 0);
        assert_ne!(rtp, rtcp);
    }
}
