//! Error types for sightline-eye

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Model load failure ({model}): {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("Inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    #[error("Inference runtime error: {0}")]
    InferenceRuntime(String),

    #[error("Malformed model output: expected {expected}, got {actual} values")]
    MalformedOutput { expected: String, actual: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pipeline disposed")]
    Disposed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl VisionError {
    pub fn model_load(model: impl Into<String>, reason: impl ToString) -> Self {
        VisionError::ModelLoad {
            model: model.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that are absorbed at an inference path boundary and turned into
    /// an empty result list for that modality.
    pub fn is_per_path(&self) -> bool {
        matches!(
            self,
            VisionError::InferenceTimeout(_)
                | VisionError::InferenceRuntime(_)
                | VisionError::MalformedOutput { .. }
                | VisionError::InvalidFrame(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;
