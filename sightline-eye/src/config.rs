//! Configuration for sightline-eye

use crate::error::VisionError;
use crate::tensor::Normalization;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Largest square input accepted for either model.
const MAX_INPUT_SIZE: u32 = 4096;
/// Longest temporal window accepted for the action model.
const MAX_SEQUENCE_LENGTH: usize = 256;

/// How the detector lays out its flat output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// `num_predictions x (4 + num_classes)`, one row per prediction
    PredictionMajor,
    /// `(4 + num_classes) x num_predictions`, one row per attribute
    AttributeMajor,
}

/// How a temporal window is stacked into the action model input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowLayout {
    /// `N x 3 x S x S`
    FrameMajor,
    /// `3 x N x S x S`
    ChannelMajor,
}

/// Object detection path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectConfig {
    /// Square model input size
    pub input_size: u32,
    /// Minimum class confidence kept after decoding
    pub confidence_threshold: f32,
    /// IoU above which the lower-confidence box is suppressed
    pub nms_threshold: f32,
    /// Cap on detections kept per frame
    pub max_detections: usize,
    /// Upper bound on one inference pass
    pub timeout_ms: u64,
    pub output_layout: OutputLayout,
    pub normalization: Normalization,
}

impl Default for ObjectConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            confidence_threshold: 0.5,
            nms_threshold: 0.45,
            max_detections: 100,
            timeout_ms: 200,
            output_layout: OutputLayout::PredictionMajor,
            normalization: Normalization::UnitRange,
        }
    }
}

/// Action recognition path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    /// Run the action path at all
    pub enabled: bool,
    /// Square model input size
    pub input_size: u32,
    /// Minimum softmax probability kept
    pub confidence_threshold: f32,
    /// Number of frames in the sliding window
    pub sequence_length: usize,
    /// Minimum time between two action inference runs
    pub interval_ms: u64,
    /// Maximum observations kept per run
    pub top_k: usize,
    /// Upper bound on one inference pass
    pub timeout_ms: u64,
    /// Observations older than this are no longer fused into results
    pub max_age_ms: u64,
    pub window_layout: WindowLayout,
    pub normalization: Normalization,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            input_size: 224,
            confidence_threshold: 0.3,
            sequence_length: 16,
            interval_ms: 1000,
            top_k: 5,
            timeout_ms: 300,
            max_age_ms: 3000,
            window_layout: WindowLayout::FrameMajor,
            normalization: Normalization::imagenet(),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub object: ObjectConfig,
    pub action: ActionConfig,
    /// Gray level used to fill letterbox padding
    pub pad_value: u8,
    /// Results buffered for the downstream consumer before new ones are dropped
    pub result_buffer: usize,
    /// Directory holding model and label files
    pub model_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            object: ObjectConfig::default(),
            action: ActionConfig::default(),
            pad_value: 114,
            result_buffer: 8,
            model_path: PathBuf::from("./models"),
        }
    }
}

fn check_unit(name: &str, value: f32) -> Result<(), VisionError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(VisionError::Config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

fn check_input_size(name: &str, value: u32) -> Result<(), VisionError> {
    if value == 0 || value > MAX_INPUT_SIZE {
        return Err(VisionError::Config(format!(
            "{} must be between 1 and {}, got {}",
            name, MAX_INPUT_SIZE, value
        )));
    }
    Ok(())
}

impl PipelineConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), VisionError> {
        check_input_size("object.input_size", self.object.input_size)?;
        check_unit("object.confidence_threshold", self.object.confidence_threshold)?;
        check_unit("object.nms_threshold", self.object.nms_threshold)?;
        if self.object.max_detections == 0 {
            return Err(VisionError::Config("object.max_detections must be > 0".to_string()));
        }
        if self.object.timeout_ms == 0 {
            return Err(VisionError::Config("object.timeout_ms must be > 0".to_string()));
        }
        self.object.normalization.validate()?;

        check_input_size("action.input_size", self.action.input_size)?;
        check_unit("action.confidence_threshold", self.action.confidence_threshold)?;
        if self.action.sequence_length == 0 || self.action.sequence_length > MAX_SEQUENCE_LENGTH {
            return Err(VisionError::Config(format!(
                "action.sequence_length must be between 1 and {}",
                MAX_SEQUENCE_LENGTH
            )));
        }
        if self.action.top_k == 0 {
            return Err(VisionError::Config("action.top_k must be > 0".to_string()));
        }
        if self.action.timeout_ms == 0 {
            return Err(VisionError::Config("action.timeout_ms must be > 0".to_string()));
        }
        self.action.normalization.validate()?;

        if self.result_buffer == 0 {
            return Err(VisionError::Config("result_buffer must be > 0".to_string()));
        }

        Ok(())
    }

    /// Load configuration from a JSON or TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VisionError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        debug!("Loaded pipeline config from {:?}", path);
        Self::from_str(&content)
    }

    /// Load configuration from a string, trying JSON first and then TOML
    pub fn from_str(content: &str) -> Result<Self, VisionError> {
        if let Ok(config) = serde_json::from_str::<PipelineConfig>(content) {
            return Ok(config);
        }
        Ok(toml::from_str::<PipelineConfig>(content)?)
    }

    /// Override selected keys from `SIGHTLINE_*` environment variables
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SIGHTLINE_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = var("SIGHTLINE_OBJECT_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.object.confidence_threshold = v;
        }
        if let Some(v) = var("SIGHTLINE_NMS_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.object.nms_threshold = v;
        }
        if let Some(v) = var("SIGHTLINE_ACTION_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.action.confidence_threshold = v;
        }
        if let Some(v) = var("SIGHTLINE_ACTION_ENABLED").and_then(|v| v.parse().ok()) {
            self.action.enabled = v;
        }
        if let Some(v) = var("SIGHTLINE_ACTION_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.action.interval_ms = v;
        }
        if let Some(v) = var("SIGHTLINE_SEQUENCE_LENGTH").and_then(|v| v.parse().ok()) {
            self.action.sequence_length = v;
        }
    }

    pub fn object_timeout(&self) -> Duration {
        Duration::from_millis(self.object.timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action.timeout_ms)
    }

    pub fn action_interval(&self) -> Duration {
        Duration::from_millis(self.action.interval_ms)
    }

    pub fn action_max_age(&self) -> Duration {
        Duration::from_millis(self.action.max_age_ms)
    }
}
