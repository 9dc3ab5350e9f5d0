//! Default software encoder backed by Cisco's OpenH264.

use openh264::OpenH264API;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, FrameType};
use openh264::formats::YUVSource;

use super::Codec;
use super::convert::I420Picture;
use super::encoder::{EncodedFrame, EncoderFactory, EncoderSettings, VideoEncoder};
use crate::error::{Result, RtspError};

/// Borrowed view that hands an [`I420Picture`] to OpenH264 without copying.
struct PictureSource<'a>(&'a I420Picture);

impl YUVSource for PictureSource<'_> {
    fn dimensions(&self) -> (usize, usize) {
        (self.0.width(), self.0.height())
    }

    fn strides(&self) -> (usize, usize, usize) {
        let w = self.0.width();
        (w, w / 2, w / 2)
    }

    fn y(&self) -> &[u8] {
        self.0.y()
    }

    fn u(&self) -> &[u8] {
        self.0.u()
    }

    fn v(&self) -> &[u8] {
        self.0.v()
    }
}

/// OpenH264 encoder sized lazily from the first picture.
pub struct OpenH264Encoder {
    inner: Encoder,
}

impl OpenH264Encoder {
    pub fn new(settings: &EncoderSettings) -> Result<Self> {
        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(settings.bitrate_bps))
            .max_frame_rate(FrameRate::from_hz(settings.fps as f32));
        let inner = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| RtspError::ResourceExhaustion(format!("openh264 encoder: {e}")))?;
        tracing::debug!(
            bitrate_bps = settings.bitrate_bps,
            fps = settings.fps,
            gop = settings.gop,
            "OpenH264 encoder created"
        );
        Ok(Self { inner })
    }
}

impl VideoEncoder for OpenH264Encoder {
    fn codec(&self) -> Codec {
        Codec::H264
    }

    fn encode(
        &mut self,
        picture: &I420Picture,
        _pts90: u64,
        force_keyframe: bool,
    ) -> Result<Option<EncodedFrame>> {
        if force_keyframe {
            self.inner.force_intra_frame();
        }
        let bitstream = self
            .inner
            .encode(&PictureSource(picture))
            .map_err(|e| RtspError::Encode(e.to_string()))?;

        let Some(keyframe) = keyframe_of(bitstream.frame_type()) else {
            return Ok(None);
        };
        let data = bitstream.to_vec();
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(EncodedFrame { data, keyframe }))
    }
}

/// `None` for frames with no output. Non-IDR intra pictures are not
/// decoder refresh points, so only IDR starts a session.
fn keyframe_of(frame_type: FrameType) -> Option<bool> {
    match frame_type {
        FrameType::Skip | FrameType::Invalid => None,
        FrameType::IDR => Some(true),
        _ => Some(false),
    }
}

/// Factory used when no other [`EncoderFactory`] is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenH264Factory;

impl EncoderFactory for OpenH264Factory {
    fn create(&self, settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(OpenH264Encoder::new(settings)?))
    }
}
