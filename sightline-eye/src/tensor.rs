//! Model input tensors and the letterbox geometry attached to them

use crate::error::VisionError;
use serde::{Deserialize, Serialize};

/// Per-channel sample normalization applied after scaling bytes to `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Normalization {
    /// `v / 255`
    UnitRange,
    /// `v / 127.5 - 1`
    Symmetric,
    /// `(v / 255 - mean[c]) / std[c]`
    MeanStd { mean: [f32; 3], std: [f32; 3] },
}

impl Normalization {
    /// ImageNet statistics used by most video classification backbones
    pub fn imagenet() -> Self {
        Normalization::MeanStd {
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }

    pub fn validate(&self) -> Result<(), VisionError> {
        if let Normalization::MeanStd { mean, std } = self {
            if mean.iter().chain(std.iter()).any(|v| !v.is_finite()) {
                return Err(VisionError::Config("normalization values must be finite".to_string()));
            }
            if std.iter().any(|s| *s <= 0.0) {
                return Err(VisionError::Config("normalization std must be > 0".to_string()));
            }
        }
        Ok(())
    }

    /// Map one byte sample of channel `c` into the model's range
    #[inline]
    pub fn apply(&self, channel: usize, value: u8) -> f32 {
        let v = value as f32;
        match self {
            Normalization::UnitRange => v / 255.0,
            Normalization::Symmetric => v / 127.5 - 1.0,
            Normalization::MeanStd { mean, std } => (v / 255.0 - mean[channel]) / std[channel],
        }
    }
}

/// Geometry needed to map model-space coordinates back into the source frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub source_width: u32,
    pub source_height: u32,
}

impl LetterboxTransform {
    /// Model space to frame space, clamped to the frame
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        let fx = (x - self.pad_x) / self.scale;
        let fy = (y - self.pad_y) / self.scale;
        (
            fx.clamp(0.0, self.source_width as f32),
            fy.clamp(0.0, self.source_height as f32),
        )
    }

    /// Frame space to model space
    pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
    }
}

/// Dense channel-major `f32` tensor.
///
/// The element count always equals `channels * height * width`; construction
/// goes through [`Tensor::new`] which enforces it.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    channels: usize,
    height: usize,
    width: usize,
    transform: Option<LetterboxTransform>,
}

impl Tensor {
    pub fn new(
        data: Vec<f32>,
        channels: usize,
        height: usize,
        width: usize,
    ) -> Result<Self, VisionError> {
        let expected = channels
            .checked_mul(height)
            .and_then(|p| p.checked_mul(width))
            .ok_or_else(|| VisionError::InvalidFrame("tensor shape overflows".to_string()))?;
        if data.len() != expected {
            return Err(VisionError::MalformedOutput {
                expected: format!("{} x {} x {}", channels, height, width),
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            channels,
            height,
            width,
            transform: None,
        })
    }

    pub fn with_transform(mut self, transform: LetterboxTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// `[channels, height, width]`
    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn transform(&self) -> Option<&LetterboxTransform> {
        self.transform.as_ref()
    }

    /// Slice of one channel plane
    pub fn plane(&self, channel: usize) -> &[f32] {
        let hw = self.height * self.width;
        &self.data[channel * hw..(channel + 1) * hw]
    }
}

/// Batched model input: flat samples plus the full shape handed to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInput {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl ModelInput {
    /// A single image with a leading batch dimension of one
    pub fn from_tensor(tensor: &Tensor) -> Self {
        let [c, h, w] = tensor.shape();
        Self {
            shape: vec![1, c, h, w],
            data: tensor.data().to_vec(),
        }
    }
}
