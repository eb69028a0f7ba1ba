//! Inference backend abstraction and loaded model sessions

use crate::error::VisionError;
use crate::models::{LabelTable, ModelSource};
use crate::tensor::ModelInput;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Opaque handle to a model loaded inside a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelHandle(u64);

impl ModelHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Native inference runtime boundary.
///
/// `run` is synchronous and may block for the duration of one forward pass;
/// callers drive it from a blocking thread.
pub trait InferenceBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Load model bytes and return a handle usable with [`run`](Self::run)
    fn load(&self, model: &[u8], labels: &LabelTable) -> Result<ModelHandle, VisionError>;

    /// Run one forward pass and return the flat output buffer
    fn run(&self, handle: ModelHandle, input: &ModelInput) -> Result<Vec<f32>, VisionError>;

    /// Free the resources held for `handle`
    fn release(&self, handle: ModelHandle);
}

/// A model loaded into a backend together with its label table.
///
/// The backend handle is released when the session is dropped.
pub struct ModelSession {
    name: String,
    backend: Arc<dyn InferenceBackend>,
    handle: ModelHandle,
    labels: LabelTable,
}

impl ModelSession {
    pub fn load(backend: Arc<dyn InferenceBackend>, source: &ModelSource) -> Result<Self, VisionError> {
        let handle = backend
            .load(&source.bytes, &source.labels)
            .map_err(|e| match e {
                VisionError::ModelLoad { .. } => e,
                other => VisionError::model_load(&source.name, other),
            })?;

        info!(
            "Loaded model {} on {} backend ({} bytes, {} labels)",
            source.name,
            backend.name(),
            source.bytes.len(),
            source.labels.len()
        );

        Ok(Self {
            name: source.name.clone(),
            backend,
            handle,
            labels: source.labels.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn run(&self, input: &ModelInput) -> Result<Vec<f32>, VisionError> {
        self.backend.run(self.handle, input)
    }
}

impl Drop for ModelSession {
    fn drop(&mut self) {
        debug!("Releasing model {} ({:?})", self.name, self.handle);
        self.backend.release(self.handle);
    }
}

impl fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSession")
            .field("name", &self.name)
            .field("backend", &self.backend.name())
            .field("handle", &self.handle)
            .field("labels", &self.labels.len())
            .finish()
    }
}
