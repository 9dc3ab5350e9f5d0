//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:rtsp-ingest                            ← server software (§6)
//! a=sendonly                                    ← direction (§6)
//! a=range:npt=0-                                ← live, open-ended
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;...            ← codec parameters
//! a=control:track1                              ← track control URL
//! ```
//!
//! All session/origin fields come from [`ServerConfig`](crate::ServerConfig).

use crate::config::ServerConfig;
use crate::media::CLOCK_RATE;
use crate::stream::Stream;

/// Control path of the single video track, relative to the stream URI.
pub const TRACK_CONTROL: &str = "track1";

/// Generate an SDP session description for the given stream.
pub fn generate_sdp(stream: &Stream, host: &str, config: &ServerConfig) -> String {
    let addr_type = if host.contains(':') { "IP6" } else { "IP4" };
    let pt = stream.payload_type();
    let mut sdp: Vec<String> = vec![
        "v=0".to_string(),
        format!(
            "o={} {} {} IN {} {}",
            config.sdp_username, config.sdp_session_id, config.sdp_session_version, addr_type, host
        ),
        format!("s={}", config.sdp_session_name),
        format!("c=IN {addr_type} {host}"),
        "t=0 0".to_string(),
        "a=tool:rtsp-ingest".to_string(),
        "a=sendonly".to_string(),
        "a=range:npt=0-".to_string(),
        format!("m=video 0 RTP/AVP {pt}"),
        // rtpmap defines the payload type and must precede fmtp (RFC 6184 §8.2.1)
        format!("a=rtpmap:{pt} {}/{CLOCK_RATE}", stream.codec().rtpmap_name()),
    ];
    if let Some(fmtp) = stream.fmtp() {
        sdp.push(fmtp);
    }
    if let Some((w, h)) = stream.config().width.zip(stream.config().height) {
        sdp.push(format!("a=framesize:{pt} {w}-{h}"));
    }
    sdp.push(format!("a=framerate:{}", stream.config().fps));
    sdp.push(format!("a=control:{TRACK_CONTROL}"));

    tracing::debug!(stream = %stream.name(), "SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
