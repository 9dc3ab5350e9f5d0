//! Optional TOML configuration file.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8554"
//! session_timeout_secs = 30
//! rtp_ports = [20000, 20999]
//!
//! [[stream]]
//! name = "cam0"
//! width = 1280
//! height = 720
//! fps = 25
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rtsp_ingest::{ServerConfig, StreamConfig};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("duplicate stream {0:?} in config")]
    DuplicateStream(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    #[serde(rename = "stream")]
    pub streams: Vec<StreamSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub public_host: Option<String>,
    pub session_timeout_secs: Option<u64>,
    pub rtp_ports: Option<(u16, u16)>,
    pub mtu: Option<usize>,
    pub session_queue_len: Option<usize>,
    pub rtcp_interval_secs: Option<u64>,
    pub default_stream: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamSection {
    pub name: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub bitrate_bps: Option<u32>,
    pub gop: Option<u32>,
}

pub fn load(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut names: Vec<&str> = config.streams.iter().map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
        return Err(ConfigError::DuplicateStream(dup[0].to_string()));
    }
    Ok(config)
}

impl ServerSection {
    /// Overwrite every field the file sets.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(host) = &self.public_host {
            config.public_host = Some(host.clone());
        }
        if let Some(secs) = self.session_timeout_secs {
            config.session_timeout = Duration::from_secs(secs);
        }
        if let Some(range) = self.rtp_ports {
            config.rtp_port_range = range;
        }
        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
        }
        if let Some(len) = self.session_queue_len {
            config.session_queue_len = len;
        }
        if let Some(secs) = self.rtcp_interval_secs {
            config.rtcp_interval = Duration::from_secs(secs);
        }
        if let Some(name) = &self.default_stream {
            config.default_stream = Some(name.clone());
        }
    }
}

impl StreamSection {
    /// Stream policy with the file's values over `base`.
    pub fn to_stream_config(&self, base: &StreamConfig) -> StreamConfig {
        StreamConfig {
            width: self.width.or(base.width),
            height: self.height.or(base.height),
            fps: self.fps.unwrap_or(base.fps),
            bitrate_bps: self.bitrate_bps.unwrap_or(base.bitrate_bps),
            gop: self.gop.unwrap_or(base.gop),
            ..base.clone()
        }
    }
}
