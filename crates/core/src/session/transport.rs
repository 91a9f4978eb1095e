use std::net::SocketAddr;

use crate::transport::udp::MulticastGroup;

/// Negotiated delivery path for a session (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=5000-5001
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
///   Transport: RTP/AVP;multicast
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=5000-5001;server_port=8000-8001
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
///   Transport: RTP/AVP;multicast;destination=224.1.7.9;port=8002-8003;ttl=16
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// UDP unicast to the client's address.
    Udp {
        client_rtp: SocketAddr,
        client_rtcp: SocketAddr,
    },
    /// `$`-framed on the RTSP connection.
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
    Multicast { group: MulticastGroup },
}

impl Transport {
    /// Format the `Transport` response header.
    pub fn header_value(&self, server_ports: (u16, u16), record: bool) -> String {
        let mut value = match self {
            Self::Udp {
                client_rtp,
                client_rtcp,
            } => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                client_rtp.port(),
                client_rtcp.port(),
                server_ports.0,
                server_ports.1
            ),
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel}"),
            Self::Multicast { group } => format!(
                "RTP/AVP;multicast;destination={};port={}-{};ttl={}",
                group.addr, group.rtp_port, group.rtcp_port, group.ttl
            ),
        };
        if record {
            value.push_str(";mode=record");
        }
        value
    }
}

/// Lower transport requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedDelivery {
    /// `client_port=RTP-RTCP`.
    Udp { rtp_port: u16, rtcp_port: u16 },
    /// `RTP/AVP/TCP`, with channels when given.
    Interleaved { channels: Option<(u8, u8)> },
    Multicast,
}

/// Parsed client `Transport` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    pub delivery: RequestedDelivery,
    /// `mode=record` (or `mode="RECORD"`) was present.
    pub record: bool,
}

impl TransportHeader {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// The header may list several comma-separated alternatives; the first
    /// one this server can serve wins.
    ///
    /// ## Examples
    ///
    /// ```
    /// use vidcast::session::transport::{RequestedDelivery, TransportHeader};
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.delivery, RequestedDelivery::Udp { rtp_port: 8000, rtcp_port: 8001 });
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3;mode=record").unwrap();
    /// assert_eq!(th.delivery, RequestedDelivery::Interleaved { channels: Some((2, 3)) });
    /// assert!(th.record);
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        header.split(',').find_map(Self::parse_one)
    }

    fn parse_one(alt: &str) -> Option<Self> {
        let mut parts = alt.split(';').map(str::trim);
        let profile = parts.next()?.to_ascii_uppercase();
        let tcp = match profile.as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => false,
            "RTP/AVP/TCP" => true,
            _ => return None,
        };

        let mut multicast = false;
        let mut client_ports = None;
        let mut channels = None;
        let mut record = false;
        for part in parts {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            match key.to_ascii_lowercase().as_str() {
                "multicast" => multicast = true,
                "client_port" => client_ports = parse_pair::<u16>(value),
                "interleaved" => channels = parse_pair::<u8>(value),
                "mode" => record = value.trim_matches('"').eq_ignore_ascii_case("record"),
                _ => {}
            }
        }

        let delivery = if tcp {
            RequestedDelivery::Interleaved { channels }
        } else if multicast {
            RequestedDelivery::Multicast
        } else {
            let (rtp_port, rtcp_port) = client_ports?;
            RequestedDelivery::Udp {
                rtp_port,
                rtcp_port,
            }
        };
        Some(Self { delivery, record })
    }
}

/// `a-b`, or a single value `a` meaning `a-(a+1)`.
fn parse_pair<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: T = value.trim().parse().ok()?;
            let b = T::try_from(u32::from(a) + 1).ok()?;
            Some((a, b))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parse_udp_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(
            th.delivery,
            RequestedDelivery::Udp {
                rtp_port: 5000,
                rtcp_port: 5001
            }
        );
        assert!(!th.record);
    }

    #[test]
    fn parse_no_client_port() {
        assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    }

    #[test]
    fn parse_interleaved_without_channels() {
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast").unwrap();
        assert_eq!(th.delivery, RequestedDelivery::Interleaved { channels: None });
    }

    #[test]
    fn parse_quoted_record_mode() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=6000-6001;mode=\"RECORD\"").unwrap();
        assert!(th.record);
    }

    #[test]
    fn picks_first_usable_alternative() {
        let th = TransportHeader::parse("RTP/SAVP;unicast;client_port=1-2,RTP/AVP;multicast").unwrap();
        assert_eq!(th.delivery, RequestedDelivery::Multicast);
    }

    #[test]
    fn single_port_implies_pair() {
        let th = TransportHeader::parse("RTP/AVP/TCP;interleaved=4").unwrap();
        assert_eq!(th.delivery, RequestedDelivery::Interleaved { channels: Some((4, 5)) });
        assert!(TransportHeader::parse("RTP/AVP/TCP;interleaved=255").is_some_and(
            |th| th.delivery == RequestedDelivery::Interleaved { channels: None }
        ));
    }

    #[test]
    fn formats_response_headers() {
        let udp = Transport::Udp {
            client_rtp: "10.0.0.2:5000".parse().unwrap(),
            client_rtcp: "10.0.0.2:5001".parse().unwrap(),
        };
        assert_eq!(
            udp.header_value((8000, 8001), false),
            "RTP/AVP;unicast;client_port=5000-5001;server_port=8000-8001"
        );
        let tcp = Transport::Interleaved {
            rtp_channel: 0,
            rtcp_channel: 1,
        };
        assert_eq!(
            tcp.header_value((8000, 8001), true),
            "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record"
        );
        let group = MulticastGroup {
            addr: Ipv4Addr::new(224, 1, 2, 3),
            rtp_port: 8002,
            rtcp_port: 8003,
            ttl: 16,
        };
        assert_eq!(
            Transport::Multicast { group }.header_value((8000, 8001), false),
            "RTP/AVP;multicast;destination=224.1.2.3;port=8002-8003;ttl=16"
        );
    }
}
