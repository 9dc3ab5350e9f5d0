//! Per-session delivery thread: packetize queued access units, write them
//! to the session's sink, and keep RTCP going in both directions.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::{Session, SessionState};
use crate::media::rtcp::{self, RtcpPacket};
use crate::media::{AccessUnit, CLOCK_RATE, Packetizer};
use crate::transport::RtpSink;

/// Longest the thread sleeps on an empty queue before polling RTCP.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(super) struct DeliveryWorker {
    pub session: Weak<Session>,
    pub queue: Receiver<Arc<AccessUnit>>,
    pub packetizer: Box<dyn Packetizer>,
    pub sink: Box<dyn RtpSink>,
    pub rtcp_interval: Duration,
}

/// Last RTP timestamp sent and when, for extrapolating SR timestamps.
struct Clock {
    rtp_timestamp: u32,
    at: Instant,
}

impl DeliveryWorker {
    pub fn run(mut self) {
        let ssrc = self.packetizer.ssrc();
        let mut clock: Option<Clock> = None;
        let mut last_report = Instant::now();
        let mut rtcp_buf = [0u8; 1500];

        let reason = loop {
            match self.queue.recv_timeout(POLL_INTERVAL) {
                Ok(au) => {
                    let Some(session) = self.session.upgrade() else {
                        break "session dropped";
                    };
                    let ts = session.rtp_timestamp(au.pts90);
                    if let Err(e) = self.send_access_unit(&session, &au, ts) {
                        tracing::warn!(session_id = %session.id, error = %e, "RTP write failed");
                        session.close("write error");
                        break "write error";
                    }
                    clock = Some(Clock {
                        rtp_timestamp: ts,
                        at: Instant::now(),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break "queue closed",
            }

            let Some(session) = self.session.upgrade() else {
                break "session dropped";
            };

            while let Some(n) = self.sink.recv_rtcp(&mut rtcp_buf) {
                handle_rtcp(&session, &rtcp_buf[..n]);
            }
            if session.state() == SessionState::Terminated {
                break "terminated";
            }

            if session.is_playing()
                && last_report.elapsed() >= self.rtcp_interval
                && let Some(clock) = &clock
            {
                last_report = Instant::now();
                let elapsed_ticks =
                    (clock.at.elapsed().as_micros() * CLOCK_RATE as u128 / 1_000_000) as u32;
                let sr = rtcp::sender_report(
                    ssrc,
                    rtcp::ntp_timestamp(SystemTime::now()),
                    clock.rtp_timestamp.wrapping_add(elapsed_ticks),
                    session.stats.packets.load(Ordering::Relaxed) as u32,
                    session.stats.octets.load(Ordering::Relaxed) as u32,
                );
                if let Err(e) = self.sink.send_rtcp(&sr) {
                    tracing::debug!(session_id = %session.id, error = %e, "RTCP SR write failed");
                } else {
                    tracing::trace!(session_id = %session.id, "RTCP SR sent");
                }
            }
        };

        if let Err(e) = self.sink.send_rtcp(&rtcp::bye(ssrc)) {
            tracing::trace!(error = %e, "RTCP BYE write failed");
        }
        tracing::debug!(
            ssrc = format_args!("{:#010X}", ssrc),
            reason,
            "delivery thread exited"
        );
    }

    fn send_access_unit(
        &mut self,
        session: &Session,
        au: &AccessUnit,
        rtp_timestamp: u32,
    ) -> std::io::Result<()> {
        let packets = self.packetizer.packetize(&au.data, rtp_timestamp);
        for packet in &packets {
            self.sink.send_rtp(packet)?;
            session.stats.packets.fetch_add(1, Ordering::Relaxed);
            session
                .stats
                .octets
                .fetch_add((packet.len() - 12) as u64, Ordering::Relaxed);
        }
        session.set_next_sequence(self.packetizer.next_sequence());
        Ok(())
    }
}

/// Inbound RTCP from the client. Anything well-formed counts as liveness;
/// a BYE ends the session.
pub(crate) fn handle_rtcp(session: &Session, datagram: &[u8]) {
    let packets = rtcp::parse_compound(datagram);
    if packets.is_empty() {
        return;
    }
    session.touch();
    for packet in packets {
        match packet {
            RtcpPacket::ReceiverReport { reports, .. } | RtcpPacket::SenderReport { reports, .. } => {
                for r in reports.iter().filter(|r| r.ssrc == session.ssrc) {
                    tracing::trace!(
                        session_id = %session.id,
                        fraction_lost = r.fraction_lost,
                        cumulative_lost = r.cumulative_lost,
                        jitter = r.jitter,
                        "RTCP receiver report"
                    );
                }
            }
            RtcpPacket::Bye { .. } => {
                session.close("RTCP BYE");
                return;
            }
            RtcpPacket::Other(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::media::Codec;
    use crate::media::rtp::RtpFields;
    use crate::session::Transport;
    use parking_lot::Mutex;
    use std::io;

    /// Records packets; RTCP in comes from a pre-seeded list.
    #[derive(Clone, Default)]
    struct RecordingSink {
        rtp: Arc<Mutex<Vec<Vec<u8>>>>,
        rtcp: Arc<Mutex<Vec<Vec<u8>>>>,
        inbound: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RtpSink for RecordingSink {
        fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()> {
            self.rtp.lock().push(packet.to_vec());
            Ok(())
        }
        fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()> {
            self.rtcp.lock().push(packet.to_vec());
            Ok(())
        }
        fn recv_rtcp(&mut self, buf: &mut [u8]) -> Option<usize> {
            let packet = self.inbound.lock().pop()?;
            buf[..packet.len()].copy_from_slice(&packet);
            Some(packet.len())
        }
    }

    fn start(sink: &RecordingSink, config: &ServerConfig) -> Arc<Session> {
        let session = Arc::new(Session::new("rtsp://h/s", "s", config.session_timeout, 30));
        session
            .attach(
                Transport::Interleaved {
                    rtp_channel: 0,
                    rtcp_channel: 1,
                },
                Codec::H264.packetizer(96, session.ssrc, 100, 1400),
                Box::new(sink.clone()),
                config,
            )
            .unwrap();
        session
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn access_units_become_rtp_with_session_timestamps() {
        let sink = RecordingSink::default();
        let session = start(&sink, &ServerConfig::default());
        session.play(None);
        for (i, keyframe) in [(0u64, true), (1, false)] {
            let au = Arc::new(AccessUnit {
                data: vec![0, 0, 0, 1, if keyframe { 0x65 } else { 0x41 }, 0xAA],
                capture: Duration::from_millis(i * 33 + 1),
                pts90: i * 2970,
                keyframe,
            });
            session.offer(&au);
        }
        assert!(wait_for(|| sink.rtp.lock().len() == 2));

        let packets = sink.rtp.lock().clone();
        let first = RtpFields::parse(&packets[0]).unwrap();
        let second = RtpFields::parse(&packets[1]).unwrap();
        assert_eq!(first.ssrc, session.ssrc);
        assert_eq!(first.sequence, 100);
        assert_eq!(second.sequence, 101);
        assert_eq!(first.timestamp, session.rtp_timestamp_base);
        assert_eq!(second.timestamp.wrapping_sub(first.timestamp), 2970);
        assert!(wait_for(|| session.next_sequence() == 102));

        session.terminate("test");
        let rtcp = sink.rtcp.lock().clone();
        assert_eq!(rtcp.last().map(|p| p[1]), Some(rtcp::PT_BYE));
    }

    #[test]
    fn sender_reports_follow_interval() {
        let sink = RecordingSink::default();
        let config = ServerConfig {
            rtcp_interval: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        let session = start(&sink, &config);
        session.play(None);
        session.offer(&Arc::new(AccessUnit {
            data: vec![0, 0, 0, 1, 0x65, 0xAA],
            capture: Duration::from_millis(1),
            pts90: 0,
            keyframe: true,
        }));
        let has_sr = || sink.rtcp.lock().iter().any(|p| p[1] == rtcp::PT_SR);
        assert!(wait_for(has_sr));
        session.terminate("test");
    }

    #[test]
    fn inbound_bye_terminates_session() {
        let sink = RecordingSink::default();
        let session = start(&sink, &ServerConfig::default());
        sink.inbound.lock().push(rtcp::bye(0x1234).to_vec());
        assert!(wait_for(|| session.state() == SessionState::Terminated));
        session.terminate("test");
    }

    #[test]
    fn rtcp_refreshes_liveness() {
        let session = Session::new("rtsp://h/s", "s", Duration::from_millis(30), 30);
        std::thread::sleep(Duration::from_millis(40));
        assert!(session.is_expired());
        let rr = [0x80, rtcp::PT_RR, 0, 1, 0, 0, 0, 9];
        handle_rtcp(&session, &rr);
        assert!(!session.is_expired());
    }
}
