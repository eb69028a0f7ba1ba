//! Frame preprocessing and model output postprocessing

pub mod action;
pub mod detection;
pub mod preprocess;
pub mod temporal;

pub use action::{softmax, ActionObservation, ActionPostprocessor};
pub use detection::{non_max_suppression, BoundingBox, Detection, DetectionPostprocessor};
pub use preprocess::{letterbox_geometry, FramePreprocessor, LetterboxGeometry};
pub use temporal::{TemporalBuffer, TemporalEntry, TemporalWindow};
