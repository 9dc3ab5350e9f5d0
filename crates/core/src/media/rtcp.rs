//! Minimal RTCP (RFC 3550 §6): sender reports and BYE out, receiver
//! feedback in.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_BYE: u8 = 203;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// 64-bit NTP timestamp for a wall-clock instant.
pub fn ntp_timestamp(now: SystemTime) -> u64 {
    let since_unix = now.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Build a sender report with no report blocks.
///
/// ```text
/// V=2 P RC=0 | PT=200 | length=6
/// SSRC | NTP msw | NTP lsw | RTP ts | packet count | octet count
/// ```
pub fn sender_report(
    ssrc: u32,
    ntp: u64,
    rtp_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
) -> [u8; 28] {
    let mut buf = [0u8; 28];
    buf[0] = 2 << 6;
    buf[1] = PT_SR;
    buf[2..4].copy_from_slice(&6u16.to_be_bytes());
    buf[4..8].copy_from_slice(&ssrc.to_be_bytes());
    buf[8..16].copy_from_slice(&ntp.to_be_bytes());
    buf[16..20].copy_from_slice(&rtp_timestamp.to_be_bytes());
    buf[20..24].copy_from_slice(&packet_count.to_be_bytes());
    buf[24..28].copy_from_slice(&octet_count.to_be_bytes());
    buf
}

/// BYE for a single source.
pub fn bye(ssrc: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0] = (2 << 6) | 1;
    buf[1] = PT_BYE;
    buf[2..4].copy_from_slice(&1u16.to_be_bytes());
    buf[4..8].copy_from_slice(&ssrc.to_be_bytes());
    buf
}

/// One reception report block from an RR or SR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    /// Fraction lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub highest_sequence: u32,
    pub jitter: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport { ssrc: u32, reports: Vec<ReportBlock> },
    ReceiverReport { ssrc: u32, reports: Vec<ReportBlock> },
    Bye { sources: Vec<u32> },
    /// SDES, APP and anything else; only the type is kept.
    Other(u8),
}

/// Split a compound RTCP datagram into its packets.
///
/// Parsing stops at the first malformed packet; whatever came before it
/// is returned.
pub fn parse_compound(mut buf: &[u8]) -> Vec<RtcpPacket> {
    let mut out = Vec::new();
    while buf.len() >= 4 {
        if buf[0] >> 6 != 2 {
            break;
        }
        let count = (buf[0] & 0x1f) as usize;
        let pt = buf[1];
        let len = (u16::from_be_bytes([buf[2], buf[3]]) as usize + 1) * 4;
        if len > buf.len() {
            break;
        }
        let body = &buf[4..len];
        let packet = match pt {
            PT_SR if body.len() >= 24 => RtcpPacket::SenderReport {
                ssrc: be32(body, 0),
                reports: report_blocks(&body[24..], count),
            },
            PT_RR if body.len() >= 4 => RtcpPacket::ReceiverReport {
                ssrc: be32(body, 0),
                reports: report_blocks(&body[4..], count),
            },
            PT_BYE => RtcpPacket::Bye {
                sources: (0..count)
                    .take_while(|i| (i + 1) * 4 <= body.len())
                    .map(|i| be32(body, i * 4))
                    .collect(),
            },
            PT_SR | PT_RR => break,
            other => RtcpPacket::Other(other),
        };
        out.push(packet);
        buf = &buf[len..];
    }
    out
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn report_blocks(buf: &[u8], count: usize) -> Vec<ReportBlock> {
    buf.chunks_exact(24)
        .take(count)
        .map(|b| ReportBlock {
            ssrc: be32(b, 0),
            fraction_lost: b[4],
            cumulative_lost: be32(b, 4) & 0x00ff_ffff,
            highest_sequence: be32(b, 8),
            jitter: be32(b, 12),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntp_offset_applied() {
        let ntp = ntp_timestamp(UNIX_EPOCH + Duration::from_millis(1500));
        assert_eq!(ntp >> 32, NTP_UNIX_OFFSET + 1);
        assert_eq!(ntp as u32, 1 << 31);
    }

    #[test]
    fn sender_report_layout() {
        let sr = sender_report(0xAABBCCDD, 0x1122334455667788, 90000, 10, 1000);
        assert_eq!(sr[0], 0x80);
        assert_eq!(sr[1], 200);
        assert_eq!(u16::from_be_bytes([sr[2], sr[3]]), 6);
        assert_eq!(be32(&sr, 4), 0xAABBCCDD);
        assert_eq!(be32(&sr, 8), 0x11223344);
        assert_eq!(be32(&sr, 16), 90000);
        assert_eq!(be32(&sr, 20), 10);
        assert_eq!(be32(&sr, 24), 1000);
    }

    #[test]
    fn bye_round_trips_through_parser() {
        let packets = parse_compound(&bye(0x01020304));
        assert_eq!(packets, vec![RtcpPacket::Bye { sources: vec![0x01020304] }]);
    }

    #[test]
    fn compound_rr_then_sdes() {
        let mut buf = vec![0x81, PT_RR, 0, 7];
        buf.extend_from_slice(&0x11111111u32.to_be_bytes());
        // report block
        buf.extend_from_slice(&0x22222222u32.to_be_bytes());
        buf.extend_from_slice(&[0x40, 0x00, 0x00, 0x05]);
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf.extend_from_slice(&12u32.to_be_bytes());
        buf.extend_from_slice(&[0; 8]);
        // SDES with an empty chunk
        buf.extend_from_slice(&[0x81, 202, 0, 1, 0, 0, 0, 0]);

        let packets = parse_compound(&buf);
        assert_eq!(packets.len(), 2);
        match &packets[0] {
            RtcpPacket::ReceiverReport { ssrc, reports } => {
                assert_eq!(*ssrc, 0x11111111);
                assert_eq!(reports.len(), 1);
                assert_eq!(reports[0].ssrc, 0x22222222);
                assert_eq!(reports[0].fraction_lost, 0x40);
                assert_eq!(reports[0].cumulative_lost, 5);
                assert_eq!(reports[0].highest_sequence, 1000);
                assert_eq!(reports[0].jitter, 12);
            }
            other => panic!("expected RR, got {other:?}"),
        }
        assert_eq!(packets[1], RtcpPacket::Other(202));
    }

    #[test]
    fn truncated_packet_stops_parsing() {
        let mut buf = bye(1).to_vec();
        buf.extend_from_slice(&[0x80, PT_RR, 0, 9, 0, 0]);
        assert_eq!(parse_compound(&buf).len(), 1);
    }

    #[test]
    fn garbage_yields_nothing() {
        assert!(parse_compound(&[0xff, 0x00, 0x00]).is_empty());
        assert!(parse_compound(&[0x00, 200, 0, 0]).is_empty());
    }
}
