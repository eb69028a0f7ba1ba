//! Camera frames as delivered by the capture collaborator

use crate::error::VisionError;
use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Largest frame edge accepted (8K)
pub const MAX_FRAME_EDGE: u32 = 7680;

/// Pixel layout of the raw planes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// One packed plane, 4 bytes per pixel
    Rgba8888,
    /// One packed plane, 3 bytes per pixel
    Rgb888,
    /// One packed plane, 3 bytes per pixel, blue first
    Bgr888,
    /// Y plane followed by an interleaved V/U plane at half resolution
    Nv21,
    /// Y plane followed by an interleaved U/V plane at half resolution
    Nv12,
    /// Separate Y, U and V planes, chroma at half resolution
    I420,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::Rgba8888 | PixelFormat::Rgb888 | PixelFormat::Bgr888 => 1,
            PixelFormat::Nv21 | PixelFormat::Nv12 => 2,
            PixelFormat::I420 => 3,
        }
    }

    /// `(bytes per row, rows)` of a tightly packed plane
    fn plane_extent(&self, index: usize, width: usize, height: usize) -> (usize, usize) {
        let cw = width.div_ceil(2);
        let ch = height.div_ceil(2);
        match (self, index) {
            (PixelFormat::Rgba8888, _) => (width * 4, height),
            (PixelFormat::Rgb888 | PixelFormat::Bgr888, _) => (width * 3, height),
            (_, 0) => (width, height),
            (PixelFormat::Nv21 | PixelFormat::Nv12, _) => (cw * 2, ch),
            (PixelFormat::I420, _) => (cw, ch),
        }
    }
}

/// One raw byte plane with its row stride
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Vec<u8>,
    pub row_stride: usize,
}

impl Plane {
    pub fn new(data: Vec<u8>, row_stride: usize) -> Self {
        Self { data, row_stride }
    }
}

/// An immutable captured frame.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    planes: Vec<Plane>,
    captured_at: DateTime<Utc>,
}

impl Frame {
    /// Build a frame from raw planes, validating dimensions and plane sizes.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<Plane>,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, VisionError> {
        if width == 0 || height == 0 {
            return Err(VisionError::InvalidFrame(format!(
                "zero-area frame {}x{}",
                width, height
            )));
        }
        if width > MAX_FRAME_EDGE || height > MAX_FRAME_EDGE {
            return Err(VisionError::InvalidFrame(format!(
                "frame {}x{} exceeds {} px",
                width, height, MAX_FRAME_EDGE
            )));
        }
        if planes.len() != format.plane_count() {
            return Err(VisionError::InvalidFrame(format!(
                "{:?} expects {} planes, got {}",
                format,
                format.plane_count(),
                planes.len()
            )));
        }

        for (index, plane) in planes.iter().enumerate() {
            let (row_bytes, rows) = format.plane_extent(index, width as usize, height as usize);
            if plane.row_stride < row_bytes {
                return Err(VisionError::InvalidFrame(format!(
                    "plane {} stride {} shorter than row of {} bytes",
                    index, plane.row_stride, row_bytes
                )));
            }
            let required = plane.row_stride * (rows - 1) + row_bytes;
            if plane.data.len() < required {
                return Err(VisionError::InvalidFrame(format!(
                    "plane {} holds {} bytes, needs {}",
                    index,
                    plane.data.len(),
                    required
                )));
            }
        }

        Ok(Self {
            width,
            height,
            format,
            planes,
            captured_at,
        })
    }

    /// Tightly packed single-plane frame
    pub fn packed(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, VisionError> {
        let (row_bytes, _) = format.plane_extent(0, width as usize, height as usize);
        Self::new(width, height, format, vec![Plane::new(data, row_bytes)], captured_at)
    }

    /// Tightly packed planes in the layout `format` expects
    pub fn from_planes(
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<Vec<u8>>,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, VisionError> {
        let planes = planes
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                let (row_bytes, _) = format.plane_extent(i, width as usize, height as usize);
                Plane::new(data, row_bytes)
            })
            .collect();
        Self::new(width, height, format, planes, captured_at)
    }

    /// Solid-color RGBA frame, mostly useful for tests and replay
    pub fn solid_rgba(width: u32, height: u32, rgba: [u8; 4], captured_at: DateTime<Utc>) -> Result<Self, VisionError> {
        let pixels = (width as usize) * (height as usize);
        let data = rgba.iter().copied().cycle().take(pixels * 4).collect();
        Self::packed(width, height, PixelFormat::Rgba8888, data, captured_at)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// RGB value of one pixel
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let (x, y) = (x as usize, y as usize);
        match self.format {
            PixelFormat::Rgba8888 => {
                let p = &self.planes[0];
                let i = y * p.row_stride + x * 4;
                [p.data[i], p.data[i + 1], p.data[i + 2]]
            }
            PixelFormat::Rgb888 => {
                let p = &self.planes[0];
                let i = y * p.row_stride + x * 3;
                [p.data[i], p.data[i + 1], p.data[i + 2]]
            }
            PixelFormat::Bgr888 => {
                let p = &self.planes[0];
                let i = y * p.row_stride + x * 3;
                [p.data[i + 2], p.data[i + 1], p.data[i]]
            }
            PixelFormat::Nv21 | PixelFormat::Nv12 => {
                let luma = &self.planes[0];
                let chroma = &self.planes[1];
                let yv = luma.data[y * luma.row_stride + x];
                let ci = (y / 2) * chroma.row_stride + (x / 2) * 2;
                let (u, v) = if self.format == PixelFormat::Nv21 {
                    (chroma.data[ci + 1], chroma.data[ci])
                } else {
                    (chroma.data[ci], chroma.data[ci + 1])
                };
                yuv_to_rgb(yv, u, v)
            }
            PixelFormat::I420 => {
                let luma = &self.planes[0];
                let u_plane = &self.planes[1];
                let v_plane = &self.planes[2];
                let yv = luma.data[y * luma.row_stride + x];
                let u = u_plane.data[(y / 2) * u_plane.row_stride + x / 2];
                let v = v_plane.data[(y / 2) * v_plane.row_stride + x / 2];
                yuv_to_rgb(yv, u, v)
            }
        }
    }

    /// Convert the whole frame into a packed RGB image
    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| Rgb(self.rgb_at(x, y)))
    }
}

/// BT.601 full-range YUV to RGB
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}
