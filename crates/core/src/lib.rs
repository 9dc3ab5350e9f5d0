//! Frame-ingest RTSP server.
//!
//! Raw frames pushed through [`StreamServer::put_frame`] are encoded per
//! named stream and served to RTSP clients over RTP (UDP or TCP
//! interleaved).
//!
//! ```no_run
//! use std::time::Duration;
//! use rtsp_ingest::{Frame, PixelFormat, ServerConfig, StreamServer};
//!
//! let mut server = StreamServer::new(ServerConfig::default());
//! server.start()?;
//! server.initialize("cam0");
//!
//! let pixels = vec![0u8; 640 * 480 * 3];
//! let frame = Frame::new(&pixels, 640, 480, PixelFormat::Bgr24, Duration::from_millis(33));
//! server.put_frame("cam0", &frame);
//! # Ok::<(), rtsp_ingest::RtspError>(())
//! ```

pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;

pub use config::{ServerConfig, StreamConfig};
pub use error::{Result, RtspError};
pub use media::convert::I420Picture;
pub use media::encoder::{EncodedFrame, EncoderFactory, EncoderSettings, VideoEncoder};
pub use media::frame::{Frame, PixelFormat};
pub use media::{Codec, Packetizer};
pub use server::{StreamServer, Viewer};
pub use stream::StreamStats;
