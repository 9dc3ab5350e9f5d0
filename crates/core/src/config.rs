//! Server and per-stream configuration.
//!
//! Defaults match a 30 fps camera feed at 2 Mbit/s with a one second GOP.

use std::time::Duration;

use crate::error::{Result, RtspError};
use crate::media::encoder::EncoderSettings;

pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_BITRATE_BPS: u32 = 2_000_000;
pub const DEFAULT_MTU: usize = 1400;
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8554";

/// Default session timeout (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Encode policy for a single stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Expected frame width. `None` locks the width from the first frame.
    pub width: Option<u32>,
    /// Expected frame height. `None` locks the height from the first frame.
    pub height: Option<u32>,
    /// Target frame rate handed to the encoder's rate control.
    pub fps: u32,
    pub bitrate_bps: u32,
    /// Keyframe interval in frames.
    pub gop: u32,
    /// Consecutive encode failures before the stream is marked degraded.
    pub max_consecutive_failures: u32,
    /// Longest `put_frame` waits for the frame slot lock.
    pub slot_wait: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            fps: DEFAULT_FPS,
            bitrate_bps: DEFAULT_BITRATE_BPS,
            gop: DEFAULT_FPS,
            max_consecutive_failures: 3,
            slot_wait: Duration::from_millis(2),
        }
    }
}

impl StreamConfig {
    /// Fixed dimensions, everything else default.
    pub fn with_dimensions(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (axis, value) in [("width", self.width), ("height", self.height)] {
            if let Some(v) = value {
                validate_dimension(axis, v)?;
            }
        }
        if self.width.is_some() != self.height.is_some() {
            return Err(RtspError::Configuration(
                "width and height must be set together".into(),
            ));
        }
        if self.fps == 0 {
            return Err(RtspError::Configuration("fps must be non-zero".into()));
        }
        if self.gop == 0 {
            return Err(RtspError::Configuration("gop must be non-zero".into()));
        }
        if self.bitrate_bps == 0 {
            return Err(RtspError::Configuration("bitrate must be non-zero".into()));
        }
        if self.max_consecutive_failures == 0 {
            return Err(RtspError::Configuration(
                "max_consecutive_failures must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            width: self.width,
            height: self.height,
            fps: self.fps,
            bitrate_bps: self.bitrate_bps,
            gop: self.gop,
        }
    }
}

/// Frame dimensions must be even (4:2:0 chroma) and non-zero.
pub fn validate_dimension(axis: &str, value: u32) -> Result<()> {
    if value == 0 || value % 2 != 0 {
        return Err(RtspError::Configuration(format!(
            "{axis} must be even and non-zero, got {value}"
        )));
    }
    Ok(())
}

/// Server-level configuration used by the RTSP layer and the stream registry.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// RTSP listen address.
    pub bind_addr: String,
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Idle time after which a session is terminated.
    pub session_timeout: Duration,
    /// How often the reaper scans for idle or terminated sessions.
    pub reaper_interval: Duration,
    /// Inclusive UDP port range for server RTP/RTCP pairs.
    pub rtp_port_range: (u16, u16),
    /// Largest RTP payload before FU fragmentation kicks in.
    pub mtu: usize,
    /// Access units buffered per session before drops start.
    pub session_queue_len: usize,
    /// Consecutive dropped access units before a session is evicted.
    pub max_session_drops: u32,
    /// RTCP sender report interval.
    pub rtcp_interval: Duration,
    /// Stream served for URIs that name no registered stream.
    pub default_stream: Option<String>,
    /// Policy applied by [`StreamServer::initialize`](crate::StreamServer::initialize).
    pub stream_defaults: StreamConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            reaper_interval: Duration::from_secs(1),
            rtp_port_range: (5000, 65534),
            mtu: DEFAULT_MTU,
            session_queue_len: 8,
            max_session_drops: 30,
            rtcp_interval: Duration::from_secs(5),
            default_stream: None,
            stream_defaults: StreamConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = self.rtp_port_range;
        if lo % 2 != 0 || lo >= hi {
            return Err(RtspError::Configuration(format!(
                "RTP port range must start even and be non-empty, got {lo}-{hi}"
            )));
        }
        if self.mtu < 64 {
            return Err(RtspError::Configuration(format!(
                "mtu {} too small",
                self.mtu
            )));
        }
        if self.session_queue_len == 0 {
            return Err(RtspError::Configuration(
                "session_queue_len must be non-zero".into(),
            ));
        }
        if self.session_timeout.is_zero() || self.reaper_interval.is_zero() {
            return Err(RtspError::Configuration(
                "session timeout and reaper interval must be non-zero".into(),
            ));
        }
        self.stream_defaults.validate()
    }
}
