//! Letterbox preprocessing of camera frames into model tensors

use crate::error::VisionError;
use crate::frame::Frame;
use crate::tensor::{LetterboxTransform, Normalization, Tensor};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tracing::debug;

const CHANNELS: usize = 3;

/// Placement of the resized image inside the square canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxGeometry {
    pub scale: f32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
}

/// Compute the aspect-preserving fit of a `width x height` frame into a
/// `size x size` canvas.
pub fn letterbox_geometry(width: u32, height: u32, size: u32) -> Result<LetterboxGeometry, VisionError> {
    if width == 0 || height == 0 {
        return Err(VisionError::InvalidFrame(format!(
            "cannot letterbox zero-area frame {}x{}",
            width, height
        )));
    }
    if size == 0 {
        return Err(VisionError::Config("letterbox target size must be > 0".to_string()));
    }

    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let resized_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let resized_height = ((height as f32 * scale).round() as u32).clamp(1, size);

    Ok(LetterboxGeometry {
        scale,
        resized_width,
        resized_height,
        offset_x: (size - resized_width) / 2,
        offset_y: (size - resized_height) / 2,
    })
}

/// Converts frames into `(3, S, S)` channel-major tensors for one model.
///
/// Stateless apart from configuration; the same frame always produces the
/// same tensor.
#[derive(Debug, Clone)]
pub struct FramePreprocessor {
    target_size: u32,
    pad_value: u8,
    normalization: Normalization,
}

impl FramePreprocessor {
    pub fn new(target_size: u32, pad_value: u8, normalization: Normalization) -> Self {
        Self {
            target_size,
            pad_value,
            normalization,
        }
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    /// Letterbox, normalize and lay out `frame` for the model.
    pub fn process(&self, frame: &Frame) -> Result<Tensor, VisionError> {
        let geometry = letterbox_geometry(frame.width(), frame.height(), self.target_size)?;
        debug!(
            "Letterboxing {}x{} -> {}x{} at ({}, {}) in {}px canvas",
            frame.width(),
            frame.height(),
            geometry.resized_width,
            geometry.resized_height,
            geometry.offset_x,
            geometry.offset_y,
            self.target_size
        );

        let canvas = self.letterbox(&frame.to_rgb_image(), &geometry);
        let tensor = self.to_chw(&canvas)?;

        // Pixels land on the integer offsets; the transform keeps the exact
        // half-padding so inverse mapping stays centered
        Ok(tensor.with_transform(LetterboxTransform {
            scale: geometry.scale,
            pad_x: (self.target_size - geometry.resized_width) as f32 / 2.0,
            pad_y: (self.target_size - geometry.resized_height) as f32 / 2.0,
            source_width: frame.width(),
            source_height: frame.height(),
        }))
    }

    fn letterbox(&self, rgb: &RgbImage, geometry: &LetterboxGeometry) -> RgbImage {
        let mut canvas = RgbImage::from_pixel(
            self.target_size,
            self.target_size,
            Rgb([self.pad_value; 3]),
        );

        if rgb.dimensions() == (geometry.resized_width, geometry.resized_height) {
            imageops::replace(&mut canvas, rgb, geometry.offset_x as i64, geometry.offset_y as i64);
        } else {
            let resized = imageops::resize(
                rgb,
                geometry.resized_width,
                geometry.resized_height,
                FilterType::Triangle,
            );
            imageops::replace(&mut canvas, &resized, geometry.offset_x as i64, geometry.offset_y as i64);
        }
        canvas
    }

    fn to_chw(&self, canvas: &RgbImage) -> Result<Tensor, VisionError> {
        let size = self.target_size as usize;
        let hw = size * size;
        let mut data = vec![0.0f32; CHANNELS * hw];

        for (i, pixel) in canvas.pixels().enumerate() {
            for c in 0..CHANNELS {
                data[c * hw + i] = self.normalization.apply(c, pixel.0[c]);
            }
        }

        Tensor::new(data, CHANNELS, size, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_geometry_landscape_720p() {
        let g = letterbox_geometry(1280, 720, 640).unwrap();
        assert_eq!(g.scale, 0.5);
        assert_eq!((g.resized_width, g.resized_height), (640, 360));
        assert_eq!((g.offset_x, g.offset_y), (0, 140));
    }

    #[test]
    fn test_geometry_portrait() {
        let g = letterbox_geometry(480, 640, 320).unwrap();
        assert_eq!(g.scale, 0.5);
        assert_eq!((g.resized_width, g.resized_height), (240, 320));
        assert_eq!((g.offset_x, g.offset_y), (40, 0));
    }

    #[test]
    fn test_geometry_upscale_small_frame() {
        let g = letterbox_geometry(100, 50, 200).unwrap();
        assert_eq!(g.scale, 2.0);
        assert_eq!((g.resized_width, g.resized_height), (200, 100));
        assert_eq!(g.offset_y, 50);
    }

    #[test]
    fn test_geometry_extreme_aspect_never_zero() {
        let g = letterbox_geometry(7680, 1, 64).unwrap();
        assert_eq!(g.resized_width, 64);
        assert_eq!(g.resized_height, 1);
    }

    #[test]
    fn test_odd_padding_kept_exact() {
        let frame = Frame::solid_rgba(1280, 721, [0, 0, 0, 255], Utc::now()).unwrap();
        let pre = FramePreprocessor::new(640, 114, Normalization::UnitRange);
        let tensor = pre.process(&frame).unwrap();
        let t = tensor.transform().unwrap();
        assert_eq!(t.pad_y, 139.5);
        let (cx, cy) = t.to_frame(320.0, 320.0);
        assert!((cx - 640.0).abs() <= 1.0);
        assert!((cy - 360.5).abs() <= 1.0);
    }

    #[test]
    fn test_geometry_zero_area() {
        assert!(matches!(
            letterbox_geometry(0, 720, 640),
            Err(VisionError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_process_shape_and_padding() {
        let frame = Frame::solid_rgba(64, 32, [255, 0, 0, 255], Utc::now()).unwrap();
        let pre = FramePreprocessor::new(32, 114, Normalization::UnitRange);
        let tensor = pre.process(&frame).unwrap();

        assert_eq!(tensor.shape(), [3, 32, 32]);
        assert_eq!(tensor.len(), 3 * 32 * 32);

        let t = tensor.transform().unwrap();
        assert_eq!(t.scale, 0.5);
        assert_eq!((t.pad_x, t.pad_y), (0.0, 8.0));

        // Top padding row is gray, center row is the red frame
        let red = tensor.plane(0);
        let green = tensor.plane(1);
        let pad = 114.0 / 255.0;
        assert!((red[0] - pad).abs() < 1e-6);
        assert!((red[16 * 32 + 16] - 1.0).abs() < 1e-6);
        assert!(green[16 * 32 + 16].abs() < 1e-6);
    }

    #[test]
    fn test_process_symmetric_range() {
        let frame = Frame::solid_rgba(8, 8, [0, 255, 0, 255], Utc::now()).unwrap();
        let pre = FramePreprocessor::new(8, 114, Normalization::Symmetric);
        let tensor = pre.process(&frame).unwrap();
        assert!(tensor.data().iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!((tensor.plane(0)[0] + 1.0).abs() < 1e-6);
        assert!((tensor.plane(1)[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_process_is_deterministic() {
        let data: Vec<u8> = (0..(40 * 30 * 3)).map(|i| (i * 7 % 251) as u8).collect();
        let frame = Frame::packed(40, 30, crate::frame::PixelFormat::Rgb888, data, Utc::now()).unwrap();
        let pre = FramePreprocessor::new(24, 114, Normalization::imagenet());
        assert_eq!(pre.process(&frame).unwrap(), pre.process(&frame).unwrap());
    }
}
