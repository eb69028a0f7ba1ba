//! Inference backends, loaded model sessions and model sources

pub mod backend;
pub mod labels;
pub mod store;
pub mod stub;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use backend::{InferenceBackend, ModelHandle, ModelSession};
pub use labels::LabelTable;
pub use store::{ModelSource, ModelStore};
pub use stub::{StubBackend, StubGate, StubModel};
#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;
