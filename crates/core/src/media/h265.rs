//! H.265 (HEVC) RTP packetizer, RFC 7798.
//!
//! Differs from H.264 in the 2-byte NAL unit header (type in bits 1..6 of
//! the first byte) and the FU layout:
//!
//! ```text
//! PayloadHdr: [F|Type=49|LayerId|TID]   (2 bytes)
//! FU header:  [S|E|FuType]              (1 byte)
//! ```

use super::rtp::RtpHeader;
use super::{Codec, Packetizer, annexb};

/// Fragmentation unit payload type (RFC 7798 §4.4.3).
const FU_TYPE: u8 = 49;

#[derive(Debug)]
pub struct H265Packetizer {
    header: RtpHeader,
    mtu: usize,
}

impl H265Packetizer {
    pub fn new(pt: u8, ssrc: u32, initial_sequence: u16, mtu: usize) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc, initial_sequence),
            mtu,
        }
    }

    fn packetize_nal(
        &mut self,
        nal_unit: &[u8],
        is_last_nal: bool,
        timestamp: u32,
        packets: &mut Vec<Vec<u8>>,
    ) {
        if nal_unit.len() < 2 {
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

        let nal_type = (nal_unit[0] >> 1) & 0x3f;
        // Keep F and LayerId MSB from byte 0, TID/LayerId LSBs from byte 1.
        let payload_hdr = [(nal_unit[0] & 0x81) | (FU_TYPE << 1), nal_unit[1]];
        let payload = &nal_unit[2..];

        let max_fragment = self.mtu - 3;
        let fragments = payload.len().div_ceil(max_fragment);

        for (i, chunk) in payload.chunks(max_fragment).enumerate() {
            let last_fragment = i + 1 == fragments;
            let mut fu_header = nal_type;
            if i == 0 {
                fu_header |= 0x80;
            }
            if last_fragment {
                fu_header |= 0x40;
            }

            let hdr = self.header.write(is_last_nal && last_fragment, timestamp);
            let mut packet = Vec::with_capacity(12 + 3 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(&payload_hdr);
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments,
            "H.265 FU fragmented NAL unit"
        );
    }
}

impl Packetizer for H265Packetizer {
    fn packetize(&mut self, access_unit: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        let nal_units = annexb::nal_units(access_unit);
        let mut packets = Vec::new();
        for (i, nal) in nal_units.iter().enumerate() {
            self.packetize_nal(nal, i + 1 == nal_units.len(), rtp_timestamp, &mut packets);
        }
        packets
    }

    fn codec(&self) -> Codec {
        Codec::H265
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
