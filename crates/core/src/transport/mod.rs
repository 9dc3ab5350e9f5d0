//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling, one
//!   thread per connection. Sessions set up with `RTP/AVP/TCP` also get
//!   their RTP and RTCP multiplexed onto this connection with `$`
//!   framing (RFC 2326 §10.12).
//!
//! - **UDP** ([`udp`]): a bound server RTP/RTCP port pair per session.
//!
//! Delivery threads only see the [`RtpSink`] trait, so they do not care
//! which of the two a session negotiated.

pub mod tcp;
pub mod udp;

use std::io;

pub use tcp::InterleavedSink;
pub use udp::{PortAllocator, UdpSink};

/// Outbound media path of one session.
pub trait RtpSink: Send {
    fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()>;

    fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()>;

    /// Non-blocking poll for one inbound RTCP datagram. Sinks whose RTCP
    /// arrives elsewhere (interleaved on the control connection) return `None`.
    fn recv_rtcp(&mut self, _buf: &mut [u8]) -> Option<usize> {
        None
    }
}
