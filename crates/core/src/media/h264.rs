use super::rtp::RtpHeader;
use super::{Codec, Packetizer, annexb};

/// H.264 RTP packetizer (RFC 6184, packetization-mode=1).
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the MTU are sent
///   as-is in a single RTP packet (12-byte header + NAL bytes).
///
/// - **FU-A Fragmentation** (§5.8): NALs exceeding the MTU are split
///   across multiple RTP packets. Each fragment carries a 2-byte FU
///   header (FU indicator + FU header) before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 2 bytes)
///   ```
///
/// Parameter sets travel in-band ahead of each IDR as the encoder emits
/// them; the SDP copy lives in [`super::params::ParameterSets`].
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
}

impl H264Packetizer {
    pub fn new(pt: u8, ssrc: u32, initial_sequence: u16, mtu: usize) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc, initial_sequence),
            mtu,
        }
    }

    /// Packetize a single NAL unit into one or more RTP packets.
    fn packetize_nal(
        &mut self,
        nal_unit: &[u8],
        is_last_nal: bool,
        timestamp: u32,
        packets: &mut Vec<Vec<u8>>,
    ) {
        if nal_unit.is_empty() {
            return;
        }

        if nal_unit.len() <= self.mtu {
            let hdr = self.header.write(is_last_nal, timestamp);
            let mut packet = Vec::with_capacity(12 + nal_unit.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal_unit);
            packets.push(packet);
            return;
        }

        let nal_header = nal_unit[0];
        let nal_type = nal_header & 0x1f;
        // F and NRI carried over, type = 28 (FU-A)
        let fu_indicator = (nal_header & 0xe0) | 28;
        let payload = &nal_unit[1..];

        let max_fragment = self.mtu - 2;
        let fragments = payload.len().div_ceil(max_fragment);

        for (i, chunk) in payload.chunks(max_fragment).enumerate() {
            let first = i == 0;
            let last_fragment = i + 1 == fragments;

            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last_fragment { 0x40 } else { 0x00 };
            let fu_header = start_bit | end_bit | nal_type;

            let hdr = self.header.write(is_last_nal && last_fragment, timestamp);
            let mut packet = Vec::with_capacity(12 + 2 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.push(fu_indicator);
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments,
            "FU-A fragmented NAL unit"
        );
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, access_unit: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        let nal_units = annexb::nal_units(access_unit);
        let mut packets = Vec::new();

        for (i, nal) in nal_units.iter().enumerate() {
            let is_last = i == nal_units.len() - 1;
            self.packetize_nal(nal, is_last, rtp_timestamp, &mut packets);
        }

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = packets.len(),
            frame_bytes = access_unit.len(),
            seq = self.header.sequence(),
            ts = rtp_timestamp,
            "access unit packetized"
        );

        packets
    }

    fn codec(&self) -> Codec {
        Codec::H264
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }
}
