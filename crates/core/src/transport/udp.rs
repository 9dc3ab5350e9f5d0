use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use parking_lot::Mutex;

use super::RtpSink;
use crate::error::{Result, RtspError};

/// Hands out bound even/odd UDP port pairs from an inclusive range.
///
/// Allocation walks the range round-robin and skips ports that fail to
/// bind, so ports released by dropped sockets are picked up again on the
/// next lap. Per RFC 3550 §11, RTP uses the even port and RTCP = RTP + 1.
pub struct PortAllocator {
    low: u16,
    high: u16,
    next: Mutex<u16>,
}

impl PortAllocator {
    pub fn new((low, high): (u16, u16)) -> Self {
        Self {
            low,
            high,
            next: Mutex::new(low),
        }
    }

    /// Bind a fresh `(rtp, rtcp)` socket pair on all interfaces.
    pub fn bind_pair(&self) -> Result<(UdpSocket, UdpSocket)> {
        let pairs = (self.high - self.low).div_ceil(2).max(1);
        let mut next = self.next.lock();
        for _ in 0..pairs {
            let rtp_port = *next;
            *next = match rtp_port.checked_add(2) {
                Some(p) if p < self.high => p,
                _ => self.low,
            };
            let bind = |port| UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
            if let Ok(rtp) = bind(rtp_port)
                && let Ok(rtcp) = bind(rtp_port + 1)
            {
                tracing::trace!(rtp_port, rtcp_port = rtp_port + 1, "allocated server ports");
                return Ok((rtp, rtcp));
            }
        }
        Err(RtspError::ResourceExhaustion(format!(
            "no free RTP port pair in {}-{}",
            self.low, self.high
        )))
    }
}

/// Session media over a bound server port pair.
///
/// RTP goes to `client_ip:client_rtp_port`, RTCP to `client_ip:client_rtcp_port`.
/// The RTCP socket is non-blocking so the delivery thread can poll it for
/// receiver reports between access units.
pub struct UdpSink {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    rtp_dest: SocketAddr,
    rtcp_dest: SocketAddr,
}

impl UdpSink {
    pub fn new(
        (rtp, rtcp): (UdpSocket, UdpSocket),
        client_ip: IpAddr,
        client_rtp_port: u16,
        client_rtcp_port: u16,
    ) -> Result<Self> {
        rtcp.set_nonblocking(true)?;
        Ok(Self {
            rtp,
            rtcp,
            rtp_dest: SocketAddr::new(client_ip, client_rtp_port),
            rtcp_dest: SocketAddr::new(client_ip, client_rtcp_port),
        })
    }

    pub fn server_ports(&self) -> Result<(u16, u16)> {
        Ok((self.rtp.local_addr()?.port(), self.rtcp.local_addr()?.port()))
    }
}

impl RtpSink for UdpSink {
    fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.rtp.send_to(packet, self.rtp_dest).map(|_| ())
    }

    fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.rtcp.send_to(packet, self.rtcp_dest).map(|_| ())
    }

    fn recv_rtcp(&mut self, buf: &mut [u8]) -> Option<usize> {
        match self.rtcp.recv_from(buf) {
            Ok((n, from)) if from.ip() == self.rtcp_dest.ip() => Some(n),
            Ok((_, from)) => {
                tracing::debug!(%from, "ignoring RTCP from unexpected peer");
                None
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                tracing::trace!(error = %e, "RTCP receive error");
                None
            }
        }
    }
}
