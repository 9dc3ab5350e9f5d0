//! Frame ingest, encoding and RTP packetization.
//!
//! Raw frames ([`frame::Frame`]) are converted to I420 ([`convert`]),
//! handed to a [`encoder::VideoEncoder`], and the resulting Annex B
//! access units are split into RTP packets by a per-session
//! [`Packetizer`].
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded video frame is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping) for reordering and loss detection.
//! - **Timestamp** (32-bit) on the 90 kHz video clock.
//! - **SSRC** (32-bit), randomly chosen to identify the sender.
//! - **Marker bit**, set on the last packet of an access unit (frame).
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) |

pub mod annexb;
pub mod convert;
pub mod encoder;
pub mod frame;
pub mod h264;
pub mod h265;
#[cfg(feature = "openh264")]
pub mod openh264;
pub mod params;
pub mod rtcp;
pub mod rtp;

use std::fmt;
use std::time::Duration;

/// Dynamic payload type used for the single video track.
pub const DYNAMIC_PAYLOAD_TYPE: u8 = 96;

/// RTP clock rate for video (RFC 3551 §4).
pub const CLOCK_RATE: u32 = 90_000;

/// Elementary stream codec produced by a stream's encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    /// Encoding name for the SDP `a=rtpmap` attribute.
    pub fn rtpmap_name(self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::H265 => "H265",
        }
    }

    /// NAL unit type from the first header byte(s), `None` if too short.
    pub fn nal_type(self, nal: &[u8]) -> Option<u8> {
        match self {
            Self::H264 => nal.first().map(|b| b & 0x1f),
            Self::H265 => (nal.len() >= 2).then(|| (nal[0] >> 1) & 0x3f),
        }
    }

    /// A fresh packetizer with its own sequence space.
    pub fn packetizer(
        self,
        pt: u8,
        ssrc: u32,
        initial_sequence: u16,
        mtu: usize,
    ) -> Box<dyn Packetizer> {
        match self {
            Self::H264 => Box::new(h264::H264Packetizer::new(pt, ssrc, initial_sequence, mtu)),
            Self::H265 => Box::new(h265::H265Packetizer::new(pt, ssrc, initial_sequence, mtu)),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rtpmap_name())
    }
}

/// Convert a capture-time offset into 90 kHz ticks.
pub fn pts90(since_first: Duration) -> u64 {
    (since_first.as_micros() * CLOCK_RATE as u128 / 1_000_000) as u64
}

/// One encoded frame shared by every subscribed session.
#[derive(Debug)]
pub struct AccessUnit {
    /// Annex B bytes.
    pub data: Vec<u8>,
    /// Producer capture timestamp.
    pub capture: Duration,
    /// Presentation time on the 90 kHz clock, relative to the stream's first frame.
    pub pts90: u64,
    pub keyframe: bool,
}

/// Codec-specific RTP packetizer.
///
/// The generic RTP header is handled by [`rtp::RtpHeader`]; packetizers
/// compose it rather than reimplementing header serialization.
pub trait Packetizer: Send {
    /// Packetize one Annex B access unit into RTP packets, all stamped
    /// with `rtp_timestamp`.
    ///
    /// Each returned `Vec<u8>` is a complete RTP packet: 12-byte header
    /// (RFC 3550 §5.1) followed by the codec-specific payload.
    fn packetize(&mut self, access_unit: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>>;

    fn codec(&self) -> Codec;

    /// RTP payload type number (RFC 3551).
    fn payload_type(&self) -> u8;

    fn ssrc(&self) -> u32;

    /// Sequence number the next packet will carry (for `RTP-Info`).
    fn next_sequence(&self) -> u16;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_from_capture_offset() {
        assert_eq!(pts90(Duration::ZERO), 0);
        assert_eq!(pts90(Duration::from_millis(33)), 2970);
        assert_eq!(pts90(Duration::from_secs(1)), 90_000);
    }

    #[test]
    fn nal_type_per_codec() {
        assert_eq!(Codec::H264.nal_type(&[0x65]), Some(5));
        assert_eq!(Codec::H265.nal_type(&[0x40, 0x01]), Some(32));
        assert_eq!(Codec::H265.nal_type(&[0x40]), None);
        assert_eq!(Codec::H264.nal_type(&[]), None);
    }
}
