//! ONNX Runtime backend

use crate::error::VisionError;
use crate::models::{InferenceBackend, LabelTable, ModelHandle};
use crate::tensor::ModelInput;
use ndarray::ArrayD;
use ort::{inputs, session::Session as OrtSession, value::TensorRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

struct LoadedModel {
    session: Mutex<OrtSession>,
    input_name: String,
    output_name: String,
}

/// Runs single-input, single-output ONNX models on the CPU provider
#[derive(Default)]
pub struct OnnxBackend {
    models: Mutex<HashMap<ModelHandle, Arc<LoadedModel>>>,
    next_handle: AtomicU64,
}

impl OnnxBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InferenceBackend for OnnxBackend {
    fn name(&self) -> &str {
        "onnx"
    }

    fn load(&self, model: &[u8], labels: &LabelTable) -> Result<ModelHandle, VisionError> {
        let session = OrtSession::builder()
            .map_err(|e| VisionError::model_load("onnx", format!("failed to create session builder: {}", e)))?
            .commit_from_memory(model)
            .map_err(|e| VisionError::model_load("onnx", format!("failed to load model from memory: {}", e)))?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| VisionError::model_load("onnx", "model declares no inputs"))?;
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .ok_or_else(|| VisionError::model_load("onnx", "model declares no outputs"))?;

        let handle = ModelHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        info!(
            "ONNX model loaded as {:?}: input '{}', output '{}', {} labels",
            handle,
            input_name,
            output_name,
            labels.len()
        );

        self.models.lock().insert(
            handle,
            Arc::new(LoadedModel {
                session: Mutex::new(session),
                input_name,
                output_name,
            }),
        );
        Ok(handle)
    }

    fn run(&self, handle: ModelHandle, input: &ModelInput) -> Result<Vec<f32>, VisionError> {
        let model = self
            .models
            .lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| VisionError::InferenceRuntime(format!("unknown handle {:?}", handle)))?;

        let array = ArrayD::from_shape_vec(input.shape.clone(), input.data.clone())
            .map_err(|e| VisionError::InferenceRuntime(format!("failed to shape input: {}", e)))?;
        let tensor = TensorRef::from_array_view(array.view())
            .map_err(|e| VisionError::InferenceRuntime(format!("failed to create tensor ref: {}", e)))?;

        let mut session = model.session.lock();
        let outputs = session
            .run(inputs![model.input_name.as_str() => tensor])
            .map_err(|e| VisionError::InferenceRuntime(format!("inference failed: {}", e)))?;

        let output = outputs[model.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| {
                VisionError::InferenceRuntime(format!("output '{}' is not f32: {}", model.output_name, e))
            })?;
        debug!("ONNX output shape {:?}", output.shape());

        Ok(output.iter().copied().collect())
    }

    fn release(&self, handle: ModelHandle) {
        self.models.lock().remove(&handle);
    }
}
