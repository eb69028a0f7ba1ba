//! Scripted in-process backend for tests and replay

use crate::error::VisionError;
use crate::models::{InferenceBackend, LabelTable, ModelHandle};
use crate::tensor::ModelInput;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type OutputFn = dyn Fn(usize, &ModelInput) -> Vec<f32> + Send + Sync;

/// Holds stub inference calls until opened.
#[derive(Default)]
pub struct StubGate {
    open: Mutex<bool>,
    cond: Condvar,
    waiting: AtomicUsize,
}

impl StubGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Release every current and future waiter
    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    /// Number of calls currently blocked on the gate
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        while !*open {
            self.cond.wait(&mut open);
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Behaviour of one stub model
pub struct StubModel {
    output: Box<OutputFn>,
    failing_calls: HashSet<usize>,
    always_fail: bool,
    delay: Option<Duration>,
    gate: Option<Arc<StubGate>>,
    calls: AtomicUsize,
}

impl StubModel {
    /// Always return `output`
    pub fn returning(output: Vec<f32>) -> Self {
        Self::from_fn(move |_, _| output.clone())
    }

    /// Compute the output from the 1-based call number and the input
    pub fn from_fn(f: impl Fn(usize, &ModelInput) -> Vec<f32> + Send + Sync + 'static) -> Self {
        Self {
            output: Box::new(f),
            failing_calls: HashSet::new(),
            always_fail: false,
            delay: None,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the given 1-based call with a runtime error
    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.failing_calls.insert(call);
        self
    }

    pub fn failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block every call until `gate` opens
    pub fn with_gate(mut self, gate: Arc<StubGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Number of `run` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn run(&self, input: &ModelInput) -> Result<Vec<f32>, VisionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let expected: usize = input.shape.iter().product();
        if expected != input.data.len() {
            return Err(VisionError::InferenceRuntime(format!(
                "input shape {:?} does not match {} samples",
                input.shape,
                input.data.len()
            )));
        }
        if self.always_fail || self.failing_calls.contains(&call) {
            return Err(VisionError::InferenceRuntime(format!("stub failure on call {}", call)));
        }

        Ok((self.output)(call, input))
    }
}

/// Backend whose models are registered by name; the model bytes passed to
/// `load` select the registered model.
#[derive(Default)]
pub struct StubBackend {
    models: HashMap<Vec<u8>, Arc<StubModel>>,
    loaded: Mutex<HashMap<ModelHandle, Arc<StubModel>>>,
    next_handle: AtomicU64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, name: &str, model: StubModel) -> Self {
        self.models.insert(name.as_bytes().to_vec(), Arc::new(model));
        self
    }

    /// Registered model, for inspecting call counts
    pub fn model(&self, name: &str) -> Option<Arc<StubModel>> {
        self.models.get(name.as_bytes()).cloned()
    }

    /// Handles loaded and not yet released
    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().len()
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn load(&self, model: &[u8], labels: &LabelTable) -> Result<ModelHandle, VisionError> {
        let name = String::from_utf8_lossy(model).into_owned();
        let stub = self
            .models
            .get(model)
            .cloned()
            .ok_or_else(|| VisionError::model_load(&name, "no stub registered under this name"))?;

        let handle = ModelHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.loaded.lock().insert(handle, stub);
        debug!("Stub loaded {} as {:?} with {} labels", name, handle, labels.len());
        Ok(handle)
    }

    fn run(&self, handle: ModelHandle, input: &ModelInput) -> Result<Vec<f32>, VisionError> {
        let stub = self
            .loaded
            .lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| VisionError::InferenceRuntime(format!("unknown handle {:?}", handle)))?;
        stub.run(input)
    }

    fn release(&self, handle: ModelHandle) {
        self.loaded.lock().remove(&handle);
    }
}
