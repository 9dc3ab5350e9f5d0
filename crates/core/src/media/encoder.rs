//! Encoder seam between the per-stream worker and a concrete codec library.

use super::Codec;
use super::convert::I420Picture;
use crate::error::Result;

/// Settings a factory receives when a stream (re)builds its encoder.
///
/// `width`/`height` are `None` when the stream locks its geometry from
/// the first frame; encoders should then size themselves lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: u32,
    pub bitrate_bps: u32,
    /// Keyframe interval in frames.
    pub gop: u32,
}

/// One encoded access unit in Annex B form.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// A video encoder owned exclusively by one stream's encode worker.
pub trait VideoEncoder: Send {
    fn codec(&self) -> Codec;

    /// Encode one picture at 90 kHz presentation time `pts90`.
    ///
    /// Returns `Ok(None)` when rate control skipped the frame.
    fn encode(
        &mut self,
        picture: &I420Picture,
        pts90: u64,
        force_keyframe: bool,
    ) -> Result<Option<EncodedFrame>>;
}

/// Builds encoders for [`StreamServer::initialize`](crate::StreamServer::initialize).
pub trait EncoderFactory: Send + Sync {
    fn create(&self, settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>>;
}

impl<F> EncoderFactory for F
where
    F: Fn(&EncoderSettings) -> Result<Box<dyn VideoEncoder>> + Send + Sync,
{
    fn create(&self, settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>> {
        self(settings)
    }
}

/// Whether an Annex B access unit carries an IDR/IRAP picture.
pub fn is_keyframe(codec: Codec, access_unit: &[u8]) -> bool {
    super::annexb::nal_units(access_unit)
        .into_iter()
        .filter_map(|nal| codec.nal_type(nal))
        .any(|t| match codec {
            Codec::H264 => t == 5,
            Codec::H265 => (16..=21).contains(&t),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_idr_detected() {
        let au = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x65, 0x88];
        assert!(is_keyframe(Codec::H264, &au));
    }

    #[test]
    fn h264_p_slice_not_keyframe() {
        let au = [0, 0, 0, 1, 0x41, 0x9a];
        assert!(!is_keyframe(Codec::H264, &au));
    }

    #[test]
    fn h265_idr_w_radl_detected() {
        // nal_unit_type 19 -> first byte 19 << 1
        let au = [0, 0, 0, 1, 0x26, 0x01, 0xaf];
        assert!(is_keyframe(Codec::H265, &au));
    }

    #[test]
    fn h265_trail_not_keyframe() {
        let au = [0, 0, 0, 1, 0x02, 0x01, 0xd0];
        assert!(!is_keyframe(Codec::H265, &au));
    }
}
