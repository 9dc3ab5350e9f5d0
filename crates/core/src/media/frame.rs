use std::fmt;
use std::time::Duration;

use crate::error::{Result, RtspError};

/// Raw pixel layout of an ingested frame.
///
/// Packed formats honour [`Frame::stride`]; planar formats must be
/// tightly packed (`stride` absent or equal to `width`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit B, G, R, the OpenCV `CV_8UC3` default.
    Bgr24,
    Rgb24,
    Bgra32,
    Rgba32,
    Gray8,
    /// Planar Y, U, V at 4:2:0.
    I420,
    /// Y plane followed by interleaved UV at 4:2:0.
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel in the first plane.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgr24 | Self::Rgb24 => 3,
            Self::Bgra32 | Self::Rgba32 => 4,
            Self::Gray8 | Self::I420 | Self::Nv12 => 1,
        }
    }

    pub fn is_planar(self) -> bool {
        matches!(self, Self::I420 | Self::Nv12)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bgr24 => "BGR24",
            Self::Rgb24 => "RGB24",
            Self::Bgra32 => "BGRA32",
            Self::Rgba32 => "RGBA32",
            Self::Gray8 => "GRAY8",
            Self::I420 => "I420",
            Self::Nv12 => "NV12",
        };
        f.write_str(name)
    }
}

/// A decoded frame borrowed from the producer for the duration of one
/// [`put_frame`](crate::StreamServer::put_frame) call.
///
/// `timestamp` is the capture time on the producer's own monotonic clock;
/// only differences between frames matter.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes per row of the first plane. `None` means tightly packed.
    pub stride: Option<usize>,
    pub timestamp: Duration,
}

impl<'a> Frame<'a> {
    pub fn new(
        data: &'a [u8],
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp: Duration,
    ) -> Self {
        Self {
            data,
            width,
            height,
            format,
            stride: None,
            timestamp,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = Some(stride);
        self
    }

    /// Row pitch of the first plane in bytes.
    pub fn row_bytes(&self) -> usize {
        self.stride
            .unwrap_or(self.width as usize * self.format.bytes_per_pixel())
    }

    /// Check geometry against the buffer. Returns the number of bytes
    /// the frame occupies, which is what the ingest slot copies.
    pub fn validate(&self) -> Result<usize> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(RtspError::InvalidFrame(format!(
                "dimensions {}x{} must be even and non-zero",
                self.width, self.height
            )));
        }

        let w = self.width as usize;
        let h = self.height as usize;
        let too_large = || {
            RtspError::InvalidFrame(format!(
                "{} {}x{} exceeds addressable size",
                self.format, self.width, self.height
            ))
        };
        let packed_row = w
            .checked_mul(self.format.bytes_per_pixel())
            .ok_or_else(too_large)?;

        let required = if self.format.is_planar() {
            if self.stride.is_some_and(|s| s != w) {
                return Err(RtspError::UnsupportedFormat(format!(
                    "{} with padded stride",
                    self.format
                )));
            }
            let chroma = (w / 2).checked_mul(h / 2).and_then(|c| c.checked_mul(2));
            w.checked_mul(h)
                .zip(chroma)
                .and_then(|(luma, chroma)| luma.checked_add(chroma))
                .ok_or_else(too_large)?
        } else {
            let stride = self.stride.unwrap_or(packed_row);
            if stride < packed_row {
                return Err(RtspError::InvalidFrame(format!(
                    "stride {stride} shorter than row of {packed_row} bytes"
                )));
            }
            // The last row need not carry padding.
            stride
                .checked_mul(h - 1)
                .and_then(|rows| rows.checked_add(packed_row))
                .ok_or_else(too_large)?
        };

        if self.data.len() < required {
            return Err(RtspError::InvalidFrame(format!(
                "{} {}x{} needs {} bytes, got {}",
                self.format,
                self.width,
                self.height,
                required,
                self.data.len()
            )));
        }
        Ok(required)
    }
}
