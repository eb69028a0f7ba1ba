//! Single-flight inference scheduler
//!
//! Frames are admitted with a non-blocking check-and-set on an in-flight
//! flag; a frame arriving while another is being analyzed is dropped. One
//! worker task preprocesses each admitted frame, runs object detection on
//! every frame and action recognition when the temporal window is full and the
//! rate gate allows it, then fuses both into an [`AnalysisResult`].

use crate::config::{PipelineConfig, WindowLayout};
use crate::error::VisionError;
use crate::frame::Frame;
use crate::fusion::{AnalysisResult, FusionStage};
use crate::models::{InferenceBackend, ModelSession, ModelSource};
use crate::processing::{
    ActionObservation, ActionPostprocessor, Detection, DetectionPostprocessor, FramePreprocessor,
    TemporalBuffer,
};
use crate::tensor::{LetterboxTransform, ModelInput};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    RunningObject,
    RunningObjectAndAction,
    Disposed,
}

/// Outcome of offering a frame to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Accepted with this sequence number
    Admitted(u64),
    /// Another frame is in flight
    Dropped,
    /// The scheduler no longer accepts frames
    Disposed,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// False when the action model failed to load (object-only mode)
    pub action_available: bool,
    pub action_enabled: bool,
    pub buffered_frames: usize,
    pub frames_admitted: u64,
    pub frames_dropped: u64,
    pub frames_skipped: u64,
    pub results_emitted: u64,
    pub results_discarded: u64,
    pub results_undelivered: u64,
    pub object_failures: u64,
    pub action_failures: u64,
    pub action_runs: u64,
}

#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    emitted: AtomicU64,
    discarded: AtomicU64,
    undelivered: AtomicU64,
    object_failures: AtomicU64,
    action_failures: AtomicU64,
    action_runs: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared between the handle and the worker task
struct Shared {
    in_flight: AtomicBool,
    cancelled: AtomicBool,
    action_enabled: AtomicBool,
    action_available: bool,
    epoch: AtomicU64,
    sequence: AtomicU64,
    state: RwLock<SchedulerState>,
    buffer: Mutex<TemporalBuffer>,
    fusion: Mutex<FusionStage>,
    latest: RwLock<Option<AnalysisResult>>,
    counters: Counters,
}

impl Shared {
    /// Move to `next` unless already disposed
    fn transition(&self, next: SchedulerState) {
        let mut state = self.state.write();
        if *state != SchedulerState::Disposed {
            *state = next;
        }
    }

    fn clear_buffers(&self) {
        self.buffer.lock().clear();
        self.fusion.lock().clear_actions();
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.cancelled.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Cache observations from a finished action run.
    ///
    /// Checked under the fusion lock; `reset` and disabling clear the cache
    /// under the same lock, so a run started before either never lands.
    fn store_actions(&self, epoch: u64, actions: Vec<ActionObservation>, now: std::time::Instant) -> bool {
        let mut fusion = self.fusion.lock();
        if !self.is_current(epoch) || !self.action_enabled.load(Ordering::SeqCst) {
            return false;
        }
        fusion.update_actions(actions, now);
        true
    }
}

struct FrameJob {
    sequence: u64,
    epoch: u64,
    frame: Frame,
    admitted_at: DateTime<Utc>,
    started: Instant,
}

/// Owns the models, buffers and worker task of one perception pipeline.
pub struct InferenceScheduler {
    shared: Arc<Shared>,
    frames: Mutex<Option<mpsc::Sender<FrameJob>>>,
    results: Mutex<Option<mpsc::Receiver<AnalysisResult>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InferenceScheduler {
    /// Load both models and start the worker.
    ///
    /// An object model that fails to load is fatal. An action model that is
    /// missing or fails to load leaves the scheduler in object-only mode.
    pub async fn initialize(
        config: PipelineConfig,
        backend: Arc<dyn InferenceBackend>,
        object: ModelSource,
        action: Option<ModelSource>,
    ) -> Result<Self, VisionError> {
        config.validate()?;
        info!("Initializing inference scheduler on {} backend", backend.name());

        if object.labels.is_empty() {
            error!("Object model {} has no labels", object.name);
            return Err(VisionError::model_load(&object.name, "label table is empty"));
        }
        let object_session = match load_session(backend.clone(), object).await {
            Ok(session) => session,
            Err(e) => {
                error!("Object model failed to load: {}", e);
                return Err(e);
            }
        };

        let action_session = match action {
            Some(source) if source.labels.is_empty() => {
                warn!("Action model {} has no labels, running object-only", source.name);
                None
            }
            Some(source) => match load_session(backend.clone(), source).await {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!("Action model failed to load, running object-only: {}", e);
                    None
                }
            },
            None => {
                info!("No action model provided, running object-only");
                None
            }
        };

        let shared = Arc::new(Shared {
            in_flight: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            action_enabled: AtomicBool::new(config.action.enabled),
            action_available: action_session.is_some(),
            epoch: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            state: RwLock::new(SchedulerState::Idle),
            buffer: Mutex::new(TemporalBuffer::new(config.action.sequence_length)),
            fusion: Mutex::new(FusionStage::new(config.action_max_age())),
            latest: RwLock::new(None),
            counters: Counters::default(),
        });

        let object_path = ObjectPath {
            preprocessor: FramePreprocessor::new(
                config.object.input_size,
                config.pad_value,
                config.object.normalization.clone(),
            ),
            postprocessor: DetectionPostprocessor::new(object_session.labels().clone(), &config.object),
            timeout: config.object_timeout(),
            session: Arc::new(object_session),
        };
        let action_path = action_session.map(|session| ActionPath {
            preprocessor: FramePreprocessor::new(
                config.action.input_size,
                config.pad_value,
                config.action.normalization.clone(),
            ),
            postprocessor: ActionPostprocessor::new(session.labels().clone(), &config.action),
            timeout: config.action_timeout(),
            interval: config.action_interval(),
            layout: config.action.window_layout,
            session: Arc::new(session),
        });

        // Capacity 1: the in-flight flag admits at most one frame at a time
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(config.result_buffer);

        let worker = Worker {
            shared: shared.clone(),
            object: object_path,
            action: action_path,
            device: Arc::new(Semaphore::new(1)),
            results: result_tx,
            last_action_run: None,
            seen_epoch: 0,
        };
        let handle = tokio::spawn(worker.run(frame_rx));

        info!(
            "Inference scheduler ready (action path {})",
            if shared.action_available { "available" } else { "unavailable" }
        );

        Ok(Self {
            shared,
            frames: Mutex::new(Some(frame_tx)),
            results: Mutex::new(Some(result_rx)),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Offer a frame. Never blocks.
    pub fn submit(&self, frame: Frame) -> Admission {
        let shared = &self.shared;
        if shared.cancelled.load(Ordering::SeqCst) {
            return Admission::Disposed;
        }
        if shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            bump(&shared.counters.dropped);
            debug!("Frame dropped, analysis in flight");
            return Admission::Dropped;
        }

        let sender = self.frames.lock().clone();
        let Some(sender) = sender else {
            shared.in_flight.store(false, Ordering::Release);
            return Admission::Disposed;
        };

        let sequence = shared.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let job = FrameJob {
            sequence,
            epoch: shared.epoch.load(Ordering::SeqCst),
            frame,
            admitted_at: Utc::now(),
            started: Instant::now(),
        };

        shared.transition(SchedulerState::RunningObject);
        match sender.try_send(job) {
            Ok(()) => {
                bump(&shared.counters.admitted);
                debug!("Admitted frame {}", sequence);
                Admission::Admitted(sequence)
            }
            Err(TrySendError::Full(_)) => {
                shared.transition(SchedulerState::Idle);
                shared.in_flight.store(false, Ordering::Release);
                bump(&shared.counters.dropped);
                Admission::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                shared.in_flight.store(false, Ordering::Release);
                Admission::Disposed
            }
        }
    }

    /// Take the downstream result stream. Only the first call returns it.
    pub fn take_results(&self) -> Option<mpsc::Receiver<AnalysisResult>> {
        self.results.lock().take()
    }

    /// Most recent result, cleared on reset
    pub fn latest_result(&self) -> Option<AnalysisResult> {
        self.shared.latest.read().clone()
    }

    pub fn state(&self) -> SchedulerState {
        *self.shared.state.read()
    }

    pub fn is_action_available(&self) -> bool {
        self.shared.action_available
    }

    /// Turn the action path on or off; turning it off clears the window.
    pub fn set_action_enabled(&self, enabled: bool) {
        if enabled && !self.shared.action_available {
            warn!("Action path requested but the action model is unavailable");
        }
        if enabled {
            self.shared.action_enabled.store(true, Ordering::SeqCst);
        } else {
            {
                let mut fusion = self.shared.fusion.lock();
                self.shared.action_enabled.store(false, Ordering::SeqCst);
                fusion.clear_actions();
            }
            self.shared.buffer.lock().clear();
        }
        info!("Action path {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Forget all temporal state, e.g. after a camera switch.
    ///
    /// A frame in flight during the reset is analyzed but its result is
    /// discarded.
    pub fn reset(&self) {
        {
            let mut fusion = self.shared.fusion.lock();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            fusion.clear_actions();
        }
        self.shared.buffer.lock().clear();
        *self.shared.latest.write() = None;
        info!("Inference scheduler reset");
    }

    pub fn status(&self) -> SchedulerStatus {
        let shared = &self.shared;
        let c = &shared.counters;
        SchedulerStatus {
            state: *shared.state.read(),
            action_available: shared.action_available,
            action_enabled: shared.action_enabled.load(Ordering::SeqCst),
            buffered_frames: shared.buffer.lock().len(),
            frames_admitted: c.admitted.load(Ordering::Relaxed),
            frames_dropped: c.dropped.load(Ordering::Relaxed),
            frames_skipped: c.skipped.load(Ordering::Relaxed),
            results_emitted: c.emitted.load(Ordering::Relaxed),
            results_discarded: c.discarded.load(Ordering::Relaxed),
            results_undelivered: c.undelivered.load(Ordering::Relaxed),
            object_failures: c.object_failures.load(Ordering::Relaxed),
            action_failures: c.action_failures.load(Ordering::Relaxed),
            action_runs: c.action_runs.load(Ordering::Relaxed),
        }
    }

    /// Stop admitting frames and wait for the worker to finish.
    ///
    /// In-flight inference completes but its result is discarded. Buffers are
    /// cleared and model handles released once the worker exits.
    pub async fn dispose(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.shared.state.write() = SchedulerState::Disposed;
        self.frames.lock().take();
        self.shared.clear_buffers();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Inference worker ended abnormally: {}", e);
            }
        }
        info!("Inference scheduler disposed");
    }
}

impl Drop for InferenceScheduler {
    fn drop(&mut self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.frames.lock().take();
    }
}

async fn load_session(
    backend: Arc<dyn InferenceBackend>,
    source: ModelSource,
) -> Result<ModelSession, VisionError> {
    tokio::task::spawn_blocking(move || ModelSession::load(backend, &source))
        .await
        .map_err(|e| VisionError::model_load("model", format!("load task failed: {}", e)))?
}

/// Run one forward pass on a blocking thread under the device permit.
///
/// The permit moves into the blocking closure, so a pass that outlives its
/// timeout still holds the device until it returns.
async fn run_inference(
    session: Arc<ModelSession>,
    input: ModelInput,
    device: Arc<Semaphore>,
    timeout: Duration,
) -> Result<Vec<f32>, VisionError> {
    let pass = async move {
        let permit = device.acquire_owned().await.map_err(|_| VisionError::Disposed)?;
        let output = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            session.run(&input)
        })
        .await
        .map_err(|e| VisionError::InferenceRuntime(format!("inference task failed: {}", e)))??;
        Ok::<Vec<f32>, VisionError>(output)
    };

    match tokio::time::timeout(timeout, pass).await {
        Ok(result) => result,
        Err(_) => Err(VisionError::InferenceTimeout(timeout)),
    }
}

struct ObjectPath {
    session: Arc<ModelSession>,
    preprocessor: FramePreprocessor,
    postprocessor: DetectionPostprocessor,
    timeout: Duration,
}

struct ActionPath {
    session: Arc<ModelSession>,
    preprocessor: FramePreprocessor,
    postprocessor: ActionPostprocessor,
    timeout: Duration,
    interval: Duration,
    layout: WindowLayout,
}

struct Worker {
    shared: Arc<Shared>,
    object: ObjectPath,
    action: Option<ActionPath>,
    device: Arc<Semaphore>,
    results: mpsc::Sender<AnalysisResult>,
    last_action_run: Option<Instant>,
    seen_epoch: u64,
}

impl Worker {
    async fn run(mut self, mut frames: mpsc::Receiver<FrameJob>) {
        while let Some(job) = frames.recv().await {
            self.process(job).await;
        }
        self.shared.buffer.lock().clear();
        debug!("Inference worker stopped");
    }

    async fn process(&mut self, job: FrameJob) {
        if job.epoch != self.seen_epoch {
            self.seen_epoch = job.epoch;
            self.last_action_run = None;
        }

        let sequence = job.sequence;
        let result = if self.shared.is_current(job.epoch) {
            self.analyze(&job).await
        } else {
            bump(&self.shared.counters.discarded);
            debug!("Frame {} predates a reset or dispose, not analyzed", sequence);
            None
        };

        let deliver = match result {
            Some(result) if self.shared.is_current(job.epoch) => {
                *self.shared.latest.write() = Some(result.clone());
                bump(&self.shared.counters.emitted);
                Some(result)
            }
            Some(_) => {
                bump(&self.shared.counters.discarded);
                debug!("Result for frame {} discarded", sequence);
                None
            }
            None => None,
        };

        // Release the gate before delivery; results stay ordered because this
        // worker handles frames one at a time
        self.shared.transition(SchedulerState::Idle);
        self.shared.in_flight.store(false, Ordering::Release);

        if let Some(result) = deliver {
            match self.results.try_send(result) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    bump(&self.shared.counters.undelivered);
                    warn!("Result consumer lagging, dropped result for frame {}", sequence);
                }
                Err(TrySendError::Closed(_)) => {
                    bump(&self.shared.counters.undelivered);
                    debug!("Result consumer gone, dropped result for frame {}", sequence);
                }
            }
        }
    }

    async fn analyze(&mut self, job: &FrameJob) -> Option<AnalysisResult> {
        let tensor = match self.object.preprocessor.process(&job.frame) {
            Ok(tensor) => tensor,
            Err(e) => {
                warn!("Skipping frame {}: {}", job.sequence, e);
                bump(&self.shared.counters.skipped);
                return None;
            }
        };
        let Some(&transform) = tensor.transform() else {
            warn!("Skipping frame {}: preprocessed tensor has no letterbox transform", job.sequence);
            bump(&self.shared.counters.skipped);
            return None;
        };
        let object_input = ModelInput::from_tensor(&tensor);
        drop(tensor);

        let action_input = self.prepare_action(job);
        if action_input.is_some() {
            self.shared.transition(SchedulerState::RunningObjectAndAction);
        }

        let detections = self.detect(object_input, &transform).await;
        if let Some((input, captured_at)) = action_input {
            let actions = self.recognize(input, captured_at).await;
            if !self.shared.store_actions(job.epoch, actions, Instant::now().into_std()) {
                debug!("Action run for frame {} outlived a reset or disable, dropped", job.sequence);
            }
        }

        let result = self.shared.fusion.lock().fuse(
            job.sequence,
            detections,
            job.admitted_at,
            job.started.into_std(),
            Instant::now().into_std(),
        );
        debug!(
            "Frame {}: {} detections, {} actions in {:?}",
            job.sequence,
            result.detections.len(),
            result.actions.len(),
            result.processing_duration
        );
        Some(result)
    }

    async fn detect(
        &self,
        input: ModelInput,
        transform: &LetterboxTransform,
    ) -> Vec<Detection> {
        let outcome = run_inference(self.object.session.clone(), input, self.device.clone(), self.object.timeout)
            .await
            .and_then(|raw| self.object.postprocessor.try_postprocess(&raw, transform));
        match outcome {
            Ok(detections) => detections,
            Err(e) => {
                bump(&self.shared.counters.object_failures);
                if e.is_per_path() {
                    warn!("Object path failed: {}", e);
                } else {
                    error!("Object path failed unexpectedly: {}", e);
                }
                Vec::new()
            }
        }
    }

    async fn recognize(&self, input: ModelInput, captured_at: DateTime<Utc>) -> Vec<ActionObservation> {
        let Some(action) = &self.action else {
            return Vec::new();
        };
        bump(&self.shared.counters.action_runs);
        let outcome = run_inference(action.session.clone(), input, self.device.clone(), action.timeout)
            .await
            .and_then(|raw| action.postprocessor.try_postprocess(&raw, captured_at));
        match outcome {
            Ok(actions) => actions,
            Err(e) => {
                bump(&self.shared.counters.action_failures);
                if e.is_per_path() {
                    warn!("Action path failed: {}", e);
                } else {
                    error!("Action path failed unexpectedly: {}", e);
                }
                Vec::new()
            }
        }
    }

    /// Push the action tensor for this frame and, when the window is full and
    /// the rate gate is open, stack the window for inference.
    fn prepare_action(&mut self, job: &FrameJob) -> Option<(ModelInput, DateTime<Utc>)> {
        let action = self.action.as_ref()?;
        if !self.shared.action_enabled.load(Ordering::SeqCst) {
            return None;
        }

        let tensor = match action.preprocessor.process(&job.frame) {
            Ok(tensor) => tensor,
            Err(e) => {
                warn!("Action preprocessing failed for frame {}: {}", job.sequence, e);
                return None;
            }
        };

        let window = {
            let mut buffer = self.shared.buffer.lock();
            if !self.shared.is_current(job.epoch) || !self.shared.action_enabled.load(Ordering::SeqCst) {
                return None;
            }
            buffer.push(tensor, job.frame.captured_at());

            let now = Instant::now();
            let due = self
                .last_action_run
                .map_or(true, |last| now.duration_since(last) >= action.interval);
            if !due {
                return None;
            }
            let window = buffer.snapshot()?;
            self.last_action_run = Some(now);
            window
        };

        let captured_at = window.last_captured_at()?;
        match window.to_model_input(action.layout) {
            Ok(input) => Some((input, captured_at)),
            Err(e) => {
                warn!("Could not stack action window: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LabelTable, StubBackend, StubModel};

    fn sources() -> (ModelSource, ModelSource) {
        (
            ModelSource::new("object", b"object".to_vec(), LabelTable::parse("person\ncar")),
            ModelSource::new("action", b"action".to_vec(), LabelTable::parse("walk\nrun\nwave")),
        )
    }

    fn small_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.object.input_size = 32;
        config.action.input_size = 16;
        config.action.sequence_length = 2;
        config.action.interval_ms = 0;
        config
    }

    fn frame() -> Frame {
        Frame::solid_rgba(64, 48, [10, 20, 30, 255], Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_object_load_failure_is_fatal() {
        let backend = Arc::new(StubBackend::new());
        let (object, action) = sources();
        let result = InferenceScheduler::initialize(small_config(), backend, object, Some(action)).await;
        assert!(matches!(result, Err(VisionError::ModelLoad { .. })));
    }

    #[tokio::test]
    async fn test_action_load_failure_degrades() {
        let backend = Arc::new(StubBackend::new().with_model("object", StubModel::returning(vec![0.0; 6])));
        let (object, action) = sources();
        let scheduler = InferenceScheduler::initialize(small_config(), backend, object, Some(action))
            .await
            .unwrap();
        assert!(!scheduler.is_action_available());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.dispose().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let backend = Arc::new(StubBackend::new().with_model("object", StubModel::returning(vec![])));
        let (object, _) = sources();
        let mut config = small_config();
        config.object.nms_threshold = 2.0;
        let result = InferenceScheduler::initialize(config, backend, object, None).await;
        assert!(matches!(result, Err(VisionError::Config(_))));
    }

    #[tokio::test]
    async fn test_action_rate_gate_and_window() {
        let backend = Arc::new(
            StubBackend::new()
                .with_model("object", StubModel::returning(vec![16.0, 16.0, 8.0, 8.0, 0.9, 0.1]))
                .with_model("action", StubModel::returning(vec![0.0, 4.0, 0.0])),
        );
        let (object, action) = sources();
        let scheduler = InferenceScheduler::initialize(small_config(), backend.clone(), object, Some(action))
            .await
            .unwrap();
        let mut results = scheduler.take_results().unwrap();
        assert!(scheduler.take_results().is_none());

        // First frame fills half the window, no action run yet
        assert!(matches!(scheduler.submit(frame()), Admission::Admitted(1)));
        let first = results.recv().await.unwrap();
        assert_eq!(first.detections.len(), 1);
        assert!(first.actions.is_empty());

        assert!(matches!(scheduler.submit(frame()), Admission::Admitted(2)));
        let second = results.recv().await.unwrap();
        assert_eq!(second.actions[0].label, "run");
        assert_eq!(backend.model("action").unwrap().calls(), 1);
        assert_eq!(scheduler.latest_result(), Some(second));

        scheduler.dispose().await;
    }
}
