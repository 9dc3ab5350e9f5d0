//! Integration tests over real sockets: RTSP handshake, RTP timing over
//! TCP interleaved transport, session expiry and stream stop.
//!
//! Each test runs its own server on a fixed loopback port.

mod common;

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{CountingFactory, FakeHevcEncoder, RtspClient, bgr_frame, wait_for};
use rtsp_ingest::{
    EncoderSettings, Frame, PixelFormat, Result, ServerConfig, StreamConfig, StreamServer,
    VideoEncoder,
};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;
const FRAME_INTERVAL: Duration = Duration::from_millis(33);
const TICKS_PER_FRAME: u32 = 2970;

fn start_server(port: u16, tweak: impl FnOnce(&mut ServerConfig)) -> (StreamServer, Arc<CountingFactory>) {
    let mut config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        rtp_port_range: (41000, 41100),
        ..ServerConfig::default()
    };
    tweak(&mut config);
    let factory = CountingFactory::new(3000);
    let mut server = StreamServer::new(config).with_encoder_factory(factory.clone());
    server.start().expect("server start");
    assert!(server.initialize_with("cam0", StreamConfig::with_dimensions(WIDTH, HEIGHT)));
    (server, factory)
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn push(server: &StreamServer, pixels: &[u8], index: u32) -> bool {
    let frame = Frame::new(
        pixels,
        WIDTH,
        HEIGHT,
        PixelFormat::Bgr24,
        FRAME_INTERVAL * (index + 1),
    );
    server.put_frame("cam0", &frame)
}

/// Minimal view of an RTP header.
#[derive(Debug, Clone, Copy)]
struct Rtp {
    marker: bool,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    nal_type: u8,
    /// Payload header type when the stream is H.265.
    hevc_type: u8,
}

fn parse_rtp(packet: &[u8]) -> Rtp {
    assert!(packet.len() > 12, "short RTP packet");
    assert_eq!(packet[0] >> 6, 2, "RTP version");
    Rtp {
        marker: packet[1] & 0x80 != 0,
        sequence: u16::from_be_bytes([packet[2], packet[3]]),
        timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
        ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        nal_type: packet[12] & 0x1F,
        hevc_type: (packet[12] >> 1) & 0x3F,
    }
}

/// DESCRIBE, SETUP interleaved and PLAY. Returns (session id, RTP-Info).
fn play_interleaved(client: &mut RtspClient, base: &str) -> (String, String) {
    assert_eq!(client.request("DESCRIBE", base, &[]).status, 200);
    let setup = client.request(
        "SETUP",
        &format!("{base}/track1"),
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
    );
    assert_eq!(setup.status, 200, "SETUP failed: {setup:?}");
    assert!(
        setup.header("Transport").unwrap().contains("interleaved=0-1"),
        "SETUP echoes channels"
    );
    let session = setup.session_id().expect("Session header");

    let play = client.request("PLAY", base, &[("Session", &session)]);
    assert_eq!(play.status, 200, "PLAY failed: {play:?}");
    let rtp_info = play.header("RTP-Info").expect("RTP-Info header").to_string();
    (session, rtp_info)
}

fn rtp_info_field(rtp_info: &str, key: &str) -> u32 {
    rtp_info
        .split(';')
        .find_map(|p| p.strip_prefix(&format!("{key}=")))
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| panic!("RTP-Info missing {key}: {rtp_info}"))
}

/// Reads RTP from channel 0 until `frames` distinct timestamps were seen.
fn collect_access_units(client: &mut RtspClient, frames: usize) -> Vec<Rtp> {
    let mut packets = Vec::new();
    let mut distinct = 0;
    while distinct < frames {
        let Some(data) = client.next_on_channel(0) else {
            break;
        };
        let rtp = parse_rtp(&data);
        if packets.last().is_none_or(|p: &Rtp| p.timestamp != rtp.timestamp) {
            distinct += 1;
        }
        packets.push(rtp);
    }
    // Trailing fragments of the last access unit.
    while packets.last().is_some_and(|p| !p.marker) {
        let Some(data) = client.next_on_channel(0) else {
            break;
        };
        packets.push(parse_rtp(&data));
    }
    packets
}

fn assert_contiguous(packets: &[Rtp]) {
    for pair in packets.windows(2) {
        assert_eq!(
            pair[1].sequence,
            pair[0].sequence.wrapping_add(1),
            "sequence gap or duplicate between {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn full_handshake_options_describe_setup_play() {
    const PORT: u16 = 18554;
    let (server, _) = start_server(PORT, |_| {});
    let pixels = bgr_frame(WIDTH, HEIGHT);
    assert!(push(&server, &pixels, 0));
    assert!(wait_for(Duration::from_secs(2), || {
        server.stream_stats("cam0").is_some_and(|s| s.access_units >= 1)
    }));

    let base = format!("rtsp://127.0.0.1:{PORT}/cam0");
    let mut client = RtspClient::connect(addr(PORT));

    let options = client.request("OPTIONS", &base, &[]);
    assert_eq!(options.status, 200);
    assert!(options.header("Public").unwrap().contains("GET_PARAMETER"));

    let describe = client.request("DESCRIBE", &base, &[("Accept", "application/sdp")]);
    assert_eq!(describe.status, 200);
    assert_eq!(describe.header("Content-Type"), Some("application/sdp"));
    assert!(describe.body.contains("m=video 0 RTP/AVP 96"));
    assert!(describe.body.contains("a=rtpmap:96 H264/90000"));
    assert!(describe.body.contains("packetization-mode=1"));
    assert!(
        describe.body.contains("sprop-parameter-sets="),
        "parameter sets published after the first keyframe: {}",
        describe.body
    );
    assert!(describe.body.contains("a=framesize:96 64-48"));

    let rtp_sock = UdpSocket::bind("127.0.0.1:41200").unwrap();
    let _rtcp_sock = UdpSocket::bind("127.0.0.1:41201").unwrap();
    rtp_sock
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();

    let setup = client.request(
        "SETUP",
        &format!("{base}/track1"),
        &[("Transport", "RTP/AVP;unicast;client_port=41200-41201")],
    );
    assert_eq!(setup.status, 200);
    let transport = setup.header("Transport").unwrap();
    assert!(transport.contains("client_port=41200-41201"));
    assert!(transport.contains("server_port=410"));
    let ssrc = transport
        .split(';')
        .find_map(|p| p.strip_prefix("ssrc="))
        .and_then(|v| u32::from_str_radix(v, 16).ok())
        .expect("ssrc in Transport");
    let session = setup.session_id().expect("Session header");
    assert!(setup.header("Session").unwrap().ends_with(";timeout=60"));

    let play = client.request("PLAY", &base, &[("Session", &session)]);
    assert_eq!(play.status, 200);
    assert!(play.header("RTP-Info").unwrap().starts_with("url="));
    assert_eq!(server.viewers().len(), 1);

    let mut received = None;
    let mut buf = [0u8; 2048];
    for i in 1..60 {
        push(&server, &pixels, i);
        if let Ok(n) = rtp_sock.recv(&mut buf) {
            received = Some(parse_rtp(&buf[..n]));
            break;
        }
    }
    let first = received.expect("RTP over UDP");
    assert_eq!(first.ssrc, ssrc);

    let keepalive = client.request("GET_PARAMETER", &base, &[("Session", &session)]);
    assert_eq!(keepalive.status, 200);

    let teardown = client.request("TEARDOWN", &base, &[("Session", &session)]);
    assert_eq!(teardown.status, 200);
    assert_eq!(server.session_count(), 0);
}

#[test]
fn thirty_frames_over_interleaved() {
    const PORT: u16 = 18555;
    let (server, _) = start_server(PORT, |_| {});
    let base = format!("rtsp://127.0.0.1:{PORT}/cam0");
    let mut client = RtspClient::connect(addr(PORT));
    let (_, rtp_info) = play_interleaved(&mut client, &base);

    let packets = thread::scope(|s| {
        s.spawn(|| {
            let pixels = bgr_frame(WIDTH, HEIGHT);
            for i in 0..30 {
                assert!(push(&server, &pixels, i));
                thread::sleep(FRAME_INTERVAL);
            }
        });
        collect_access_units(&mut client, 30)
    });

    let mut timestamps: Vec<u32> = packets.iter().map(|p| p.timestamp).collect();
    timestamps.dedup();
    assert_eq!(timestamps.len(), 30, "one RTP timestamp per frame");
    for pair in timestamps.windows(2) {
        let delta = pair[1].wrapping_sub(pair[0]);
        assert!(delta > 0 && delta < u32::MAX / 2, "timestamps increase");
        assert_eq!(delta % TICKS_PER_FRAME, 0, "delta {delta} is whole frames");
    }

    assert_contiguous(&packets);
    assert_eq!(u32::from(packets[0].sequence), rtp_info_field(&rtp_info, "seq"));
    assert_eq!(packets[0].timestamp, rtp_info_field(&rtp_info, "rtptime"));
    assert_eq!(packets[0].nal_type, 7, "stream starts with SPS");

    // Marker only on the last packet of each access unit.
    for pair in packets.windows(2) {
        let last_of_au = pair[0].timestamp != pair[1].timestamp;
        assert_eq!(pair[0].marker, last_of_au, "marker on {:?}", pair[0]);
    }
    assert!(packets.last().unwrap().marker);
    // The 3000 byte IDR slice does not fit one packet.
    assert!(packets.iter().any(|p| p.nal_type == 28), "expected FU-A fragments");
}

#[test]
fn initialize_twice_keeps_sequence_continuity() {
    const PORT: u16 = 18556;
    let (server, factory) = start_server(PORT, |_| {});
    let base = format!("rtsp://127.0.0.1:{PORT}/cam0");
    let mut client = RtspClient::connect(addr(PORT));
    play_interleaved(&mut client, &base);

    let packets = thread::scope(|s| {
        s.spawn(|| {
            let pixels = bgr_frame(WIDTH, HEIGHT);
            for i in 0..20 {
                if i == 10 {
                    assert!(server.initialize("cam0"));
                }
                assert!(push(&server, &pixels, i));
                thread::sleep(FRAME_INTERVAL);
            }
        });
        collect_access_units(&mut client, 20)
    });

    assert_eq!(factory.created(), 1, "healthy stream keeps its encoder");
    let mut timestamps: Vec<u32> = packets.iter().map(|p| p.timestamp).collect();
    timestamps.dedup();
    assert_eq!(timestamps.len(), 20);
    assert_contiguous(&packets);
}

#[test]
fn idle_session_times_out() {
    const PORT: u16 = 18557;
    let (server, _) = start_server(PORT, |c| {
        c.session_timeout = Duration::from_secs(1);
        c.reaper_interval = Duration::from_millis(100);
    });
    let base = format!("rtsp://127.0.0.1:{PORT}/cam0");
    let mut client = RtspClient::connect(addr(PORT));

    let setup = client.request(
        "SETUP",
        &format!("{base}/track1"),
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
    );
    assert_eq!(setup.status, 200);
    assert!(setup.header("Session").unwrap().ends_with(";timeout=1"));
    let session = setup.session_id().unwrap();
    assert_eq!(server.session_count(), 1);

    assert!(
        wait_for(Duration::from_secs(4), || server.session_count() == 0),
        "idle session reaped"
    );
    let play = client.request("PLAY", &base, &[("Session", &session)]);
    assert_eq!(play.status, 454);
}

#[test]
fn keepalive_holds_session_open() {
    const PORT: u16 = 18558;
    let (server, _) = start_server(PORT, |c| {
        c.session_timeout = Duration::from_secs(1);
        c.reaper_interval = Duration::from_millis(100);
    });
    let base = format!("rtsp://127.0.0.1:{PORT}/cam0");
    let mut client = RtspClient::connect(addr(PORT));
    let setup = client.request(
        "SETUP",
        &format!("{base}/track1"),
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
    );
    let session = setup.session_id().unwrap();

    for _ in 0..6 {
        thread::sleep(Duration::from_millis(400));
        let resp = client.request("GET_PARAMETER", &base, &[("Session", &session)]);
        assert_eq!(resp.status, 200);
    }
    assert_eq!(server.session_count(), 1);
}

#[test]
fn stop_ends_sessions_with_bye() {
    const PORT: u16 = 18559;
    let (server, _) = start_server(PORT, |_| {});
    let base = format!("rtsp://127.0.0.1:{PORT}/cam0");
    let mut client = RtspClient::connect(addr(PORT));
    play_interleaved(&mut client, &base);

    let pixels = bgr_frame(WIDTH, HEIGHT);
    for i in 0..3 {
        assert!(push(&server, &pixels, i));
        thread::sleep(FRAME_INTERVAL);
    }
    assert!(client.next_on_channel(0).is_some(), "media flowing");

    assert!(server.stop("cam0"));
    assert_eq!(server.session_count(), 0);
    assert!(!push(&server, &pixels, 10), "stopped stream rejects frames");

    let mut saw_bye = false;
    while let Some(rtcp) = client.next_on_channel(1) {
        if rtcp.get(1) == Some(&203) {
            saw_bye = true;
            break;
        }
    }
    assert!(saw_bye, "RTCP BYE on the interleaved RTCP channel");

    assert_eq!(client.request("DESCRIBE", &base, &[]).status, 404);
}

#[test]
fn unknown_paths_and_methods() {
    const PORT: u16 = 18560;
    let (_server, _) = start_server(PORT, |_| {});
    let mut client = RtspClient::connect(addr(PORT));

    let describe = client.request("DESCRIBE", &format!("rtsp://127.0.0.1:{PORT}/nope"), &[]);
    assert_eq!(describe.status, 404);

    let record = client.request("RECORD", &format!("rtsp://127.0.0.1:{PORT}/cam0"), &[]);
    assert_eq!(record.status, 501);

    let multicast = client.request(
        "SETUP",
        &format!("rtsp://127.0.0.1:{PORT}/cam0/track1"),
        &[("Transport", "RTP/AVP;multicast")],
    );
    assert_eq!(multicast.status, 461);
}

#[test]
fn h265_stream_over_interleaved() {
    const PORT: u16 = 18561;
    let factory = |_: &EncoderSettings| -> Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(FakeHevcEncoder::new(3000, 200)))
    };
    let mut server = StreamServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{PORT}"),
        rtp_port_range: (41000, 41100),
        ..ServerConfig::default()
    })
    .with_encoder_factory(Arc::new(factory));
    server.start().expect("server start");
    assert!(server.initialize_with("cam0", StreamConfig::with_dimensions(WIDTH, HEIGHT)));

    // Parameter sets reach the SDP once the first keyframe is encoded.
    let pixels = bgr_frame(WIDTH, HEIGHT);
    assert!(push(&server, &pixels, 0));
    let base = format!("rtsp://127.0.0.1:{PORT}/cam0");
    let mut client = RtspClient::connect(addr(PORT));
    assert!(wait_for(Duration::from_secs(2), || {
        server.stream_stats("cam0").unwrap().access_units >= 1
    }));
    let describe = client.request("DESCRIBE", &base, &[]);
    assert_eq!(describe.status, 200);
    assert!(describe.body.contains("a=rtpmap:96 H265/90000"), "{}", describe.body);
    for key in ["sprop-vps=", "sprop-sps=", "sprop-pps="] {
        assert!(describe.body.contains(key), "missing {key}: {}", describe.body);
    }

    let (_, rtp_info) = play_interleaved(&mut client, &base);
    let packets = thread::scope(|s| {
        s.spawn(|| {
            for i in 1..=10 {
                assert!(push(&server, &pixels, i));
                thread::sleep(FRAME_INTERVAL);
            }
        });
        collect_access_units(&mut client, 10)
    });

    assert_contiguous(&packets);
    assert_eq!(u32::from(packets[0].sequence), rtp_info_field(&rtp_info, "seq"));
    assert_eq!(packets[0].hevc_type, 32, "stream starts with VPS");
    for pair in packets.windows(2) {
        let last_of_au = pair[0].timestamp != pair[1].timestamp;
        assert_eq!(pair[0].marker, last_of_au, "marker on {:?}", pair[0]);
    }
    // The 3000 byte IDR slice is split into FU packets.
    assert!(packets.iter().any(|p| p.hevc_type == 49), "expected FU fragments");
}
