use std::net::IpAddr;

/// Negotiated RTP/RTCP transport for a session (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001;ssrc=1A2B3C4D
///
/// Client → Server:
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// Server → Client:
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1;ssrc=1A2B3C4D
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Udp {
        client_ip: IpAddr,
        client_rtp_port: u16,
        client_rtcp_port: u16,
        server_rtp_port: u16,
        server_rtcp_port: u16,
    },
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl Transport {
    /// Value for the SETUP response `Transport` header.
    pub fn response_header(&self, ssrc: u32) -> String {
        match self {
            Self::Udp {
                client_rtp_port,
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port,
                ..
            } => format!(
                "RTP/AVP;unicast;client_port={client_rtp_port}-{client_rtcp_port};\
                 server_port={server_rtp_port}-{server_rtcp_port};ssrc={ssrc:08X}"
            ),
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!(
                "RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel};ssrc={ssrc:08X}"
            ),
        }
    }

    /// Short human-readable peer description for logs and [`Viewer`](crate::Viewer).
    pub fn describe(&self) -> String {
        match self {
            Self::Udp {
                client_ip,
                client_rtp_port,
                ..
            } => format!("udp://{client_ip}:{client_rtp_port}"),
            Self::Interleaved { rtp_channel, .. } => format!("tcp interleaved ch {rtp_channel}"),
        }
    }
}

/// What the client asked for in its `Transport` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    /// `channels` is `None` when the client left channel choice to the server.
    Interleaved { channels: Option<(u8, u8)> },
}

/// Why a `Transport` header could not be honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRejection {
    /// Well-formed but asks for something we do not serve (multicast,
    /// non-RTP profiles). Maps to 461.
    Unsupported,
    /// Missing or garbled parameters. Maps to 400.
    Malformed,
}

impl TransportHeader {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// The header may list several comma-separated alternatives; the first
    /// one we can serve wins.
    ///
    /// ## Examples
    ///
    /// ```
    /// use rtsp_ingest::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(
    ///     th,
    ///     TransportHeader::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 }
    /// );
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;multicast").is_err());
    /// ```
    pub fn parse(header: &str) -> Result<Self, TransportRejection> {
        let mut rejection = TransportRejection::Malformed;
        for candidate in header.split(',') {
            match Self::parse_one(candidate) {
                Ok(t) => return Ok(t),
                Err(TransportRejection::Unsupported) => rejection = TransportRejection::Unsupported,
                Err(TransportRejection::Malformed) => {}
            }
        }
        Err(rejection)
    }

    fn parse_one(candidate: &str) -> Result<Self, TransportRejection> {
        let mut parts = candidate.split(';').map(str::trim);
        let profile = parts.next().unwrap_or("").to_ascii_uppercase();
        let tcp = match profile.as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => false,
            "RTP/AVP/TCP" => true,
            "" => return Err(TransportRejection::Malformed),
            _ => return Err(TransportRejection::Unsupported),
        };

        let mut client_ports = None;
        let mut channels = None;
        for param in parts {
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            match key.to_ascii_lowercase().as_str() {
                "multicast" => return Err(TransportRejection::Unsupported),
                "client_port" => client_ports = Some(parse_pair::<u16>(value)?),
                "interleaved" => channels = Some(parse_pair::<u8>(value)?),
                _ => {}
            }
        }

        if tcp {
            Ok(Self::Interleaved { channels })
        } else {
            let (rtp, rtcp) = client_ports.ok_or(TransportRejection::Malformed)?;
            Ok(Self::Udp {
                client_rtp_port: rtp,
                client_rtcp_port: rtcp,
            })
        }
    }
}

/// `a-b`, or a lone `a` meaning `a-(a+1)`.
fn parse_pair<T>(value: &str) -> Result<(T, T), TransportRejection>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    let mut it = value.split('-');
    let first: T = it
        .next()
        .and_then(|v| v.trim().parse().ok())
        .ok_or(TransportRejection::Malformed)?;
    let second: T = match it.next() {
        Some(v) => v.trim().parse().map_err(|_| TransportRejection::Malformed)?,
        None => T::try_from(u32::from(first) + 1).map_err(|_| TransportRejection::Malformed)?,
    };
    Ok((first, second))
}
