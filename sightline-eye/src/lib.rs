//! sightline-eye: real-time video perception pipeline
//!
//! Turns a stream of camera frames into per-frame analysis results that fuse
//! object detections with actions recognized over a sliding window of frames.
//! Two models with different input shapes and cadences share one inference
//! device; the [`InferenceScheduler`] admits at most one frame at a time and
//! never blocks the producer.

pub mod config;
pub mod error;
pub mod frame;
pub mod fusion;
pub mod models;
pub mod processing;
pub mod scheduler;
pub mod tensor;

pub use config::{ActionConfig, ObjectConfig, OutputLayout, PipelineConfig, WindowLayout};
pub use error::VisionError;
pub use frame::{Frame, PixelFormat, Plane};
pub use fusion::{AnalysisResult, FusionStage};
pub use models::{InferenceBackend, LabelTable, ModelSession, ModelSource, ModelStore};
pub use processing::{ActionObservation, BoundingBox, Detection};
pub use scheduler::{Admission, InferenceScheduler, SchedulerState, SchedulerStatus};
pub use tensor::{LetterboxTransform, Normalization, Tensor};
