//! Pixel conversion into the encoder's I420 input.
//!
//! RGB-family inputs use integer BT.601 limited-range coefficients.
//! Chroma is the average of each 2x2 block before conversion.

use super::frame::{Frame, PixelFormat};
use crate::error::Result;

/// A tightly packed planar 4:2:0 picture.
#[derive(Debug, Default, Clone)]
pub struct I420Picture {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl I420Picture {
    pub fn new(width: usize, height: usize) -> Self {
        let mut picture = Self::default();
        picture.resize(width, height);
        picture
    }

    fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.data.resize(width * height + 2 * (width / 2) * (height / 2), 0);
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn y(&self) -> &[u8] {
        &self.data[..self.width * self.height]
    }

    pub fn u(&self) -> &[u8] {
        let y_len = self.width * self.height;
        &self.data[y_len..y_len + self.chroma_len()]
    }

    pub fn v(&self) -> &[u8] {
        let start = self.width * self.height + self.chroma_len();
        &self.data[start..start + self.chroma_len()]
    }

    fn chroma_len(&self) -> usize {
        (self.width / 2) * (self.height / 2)
    }

    fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let y_len = self.width * self.height;
        let c_len = self.chroma_len();
        let (y, rest) = self.data.split_at_mut(y_len);
        let (u, v) = rest.split_at_mut(c_len);
        (y, u, &mut v[..c_len])
    }
}

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

#[inline]
fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// Convert any supported frame into `out`, reusing its allocation.
pub fn to_i420(frame: &Frame<'_>, out: &mut I420Picture) -> Result<()> {
    frame.validate()?;
    let w = frame.width as usize;
    let h = frame.height as usize;
    out.resize(w, h);

    match frame.format {
        PixelFormat::I420 => {
            let len = out.data.len();
            out.data.copy_from_slice(&frame.data[..len]);
        }
        PixelFormat::Nv12 => {
            let (y, u, v) = out.planes_mut();
            y.copy_from_slice(&frame.data[..w * h]);
            let uv = &frame.data[w * h..w * h + u.len() * 2];
            for (i, pair) in uv.chunks_exact(2).enumerate() {
                u[i] = pair[0];
                v[i] = pair[1];
            }
        }
        PixelFormat::Gray8 => {
            let stride = frame.row_bytes();
            let (y, u, v) = out.planes_mut();
            for row in 0..h {
                let src = &frame.data[row * stride..row * stride + w];
                for (dst, &g) in y[row * w..(row + 1) * w].iter_mut().zip(src) {
                    *dst = (16 + (g as u32 * 219 + 127) / 255) as u8;
                }
            }
            u.fill(128);
            v.fill(128);
        }
        PixelFormat::Bgr24 | PixelFormat::Bgra32 => packed_rgb_to_i420(frame, (2, 1, 0), out),
        PixelFormat::Rgb24 | PixelFormat::Rgba32 => packed_rgb_to_i420(frame, (0, 1, 2), out),
    }
    Ok(())
}

/// `offsets` are the byte positions of R, G and B within one pixel.
fn packed_rgb_to_i420(frame: &Frame<'_>, offsets: (usize, usize, usize), out: &mut I420Picture) {
    let (ro, go, bo) = offsets;
    let w = frame.width as usize;
    let h = frame.height as usize;
    let bpp = frame.format.bytes_per_pixel();
    let stride = frame.row_bytes();
    let data = frame.data;
    let cw = w / 2;
    let (y_plane, u_plane, v_plane) = out.planes_mut();

    let pixel = |row: usize, col: usize| -> (i32, i32, i32) {
        let i = row * stride + col * bpp;
        (
            data[i + ro] as i32,
            data[i + go] as i32,
            data[i + bo] as i32,
        )
    };

    for row in (0..h).step_by(2) {
        for col in (0..w).step_by(2) {
            let mut sum = (0, 0, 0);
            for (dr, dc) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let (r, g, b) = pixel(row + dr, col + dc);
                y_plane[(row + dr) * w + col + dc] = luma(r, g, b);
                sum.0 += r;
                sum.1 += g;
                sum.2 += b;
            }
            let (u, v) = chroma((sum.0 + 2) / 4, (sum.1 + 2) / 4, (sum.2 + 2) / 4);
            let ci = (row / 2) * cw + col / 2;
            u_plane[ci] = u;
            v_plane[ci] = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn solid(w: u32, h: u32, px: &[u8]) -> Vec<u8> {
        px.repeat((w * h) as usize)
    }

    #[test]
    fn black_bgr_maps_to_limited_range_black() {
        let data = solid(4, 2, &[0, 0, 0]);
        let frame = Frame::new(&data, 4, 2, PixelFormat::Bgr24, Duration::ZERO);
        let mut pic = I420Picture::default();
        to_i420(&frame, &mut pic).unwrap();
        assert!(pic.y().iter().all(|&y| y == 16));
        assert!(pic.u().iter().all(|&u| u == 128));
        assert!(pic.v().iter().all(|&v| v == 128));
    }

    #[test]
    fn white_rgb_maps_to_limited_range_white() {
        let data = solid(2, 2, &[255, 255, 255]);
        let frame = Frame::new(&data, 2, 2, PixelFormat::Rgb24, Duration::ZERO);
        let mut pic = I420Picture::default();
        to_i420(&frame, &mut pic).unwrap();
        assert!(pic.y().iter().all(|&y| y == 235));
        assert_eq!(pic.u(), &[128]);
        assert_eq!(pic.v(), &[128]);
    }

    #[test]
    fn bgr_and_rgb_red_agree() {
        let bgr = solid(2, 2, &[0, 0, 255]);
        let rgb = solid(2, 2, &[255, 0, 0]);
        let mut a = I420Picture::default();
        let mut b = I420Picture::default();
        to_i420(&Frame::new(&bgr, 2, 2, PixelFormat::Bgr24, Duration::ZERO), &mut a).unwrap();
        to_i420(&Frame::new(&rgb, 2, 2, PixelFormat::Rgb24, Duration::ZERO), &mut b).unwrap();
        assert_eq!(a.y(), b.y());
        assert_eq!(a.v(), b.v());
        assert!(a.v()[0] > 200, "red carries strong Cr");
    }

    #[test]
    fn nv12_deinterleaves_chroma() {
        // 2x2: four luma bytes then one UV pair
        let data = [1, 2, 3, 4, 50, 60];
        let frame = Frame::new(&data, 2, 2, PixelFormat::Nv12, Duration::ZERO);
        let mut pic = I420Picture::default();
        to_i420(&frame, &mut pic).unwrap();
        assert_eq!(pic.y(), &[1, 2, 3, 4]);
        assert_eq!(pic.u(), &[50]);
        assert_eq!(pic.v(), &[60]);
    }

    #[test]
    fn strided_bgra_skips_padding() {
        // 2x2 BGRA with 4 bytes of padding per row filled with 0xFF
        let mut data = Vec::new();
        for _ in 0..2 {
            data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
            data.extend_from_slice(&[0xFF; 4]);
        }
        let frame =
            Frame::new(&data, 2, 2, PixelFormat::Bgra32, Duration::ZERO).with_stride(12);
        let mut pic = I420Picture::default();
        to_i420(&frame, &mut pic).unwrap();
        assert!(pic.y().iter().all(|&y| y == 16));
    }

    #[test]
    fn picture_reused_across_sizes() {
        let mut pic = I420Picture::new(4, 4);
        let data = vec![0u8; 2 * 2];
        to_i420(&Frame::new(&data, 2, 2, PixelFormat::Gray8, Duration::ZERO), &mut pic).unwrap();
        assert_eq!(pic.width(), 2);
        assert_eq!(pic.y().len(), 4);
        assert_eq!(pic.u().len(), 1);
    }
}
