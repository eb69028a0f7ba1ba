// sightline-replay: drive the perception pipeline with synthetic frames
// and print every analysis result as a JSON line

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use sightline_eye::models::{InferenceBackend, LabelTable, ModelSource, ModelStore, StubBackend, StubModel};
use sightline_eye::frame::MAX_FRAME_EDGE;
use sightline_eye::{Admission, Frame, InferenceScheduler, PipelineConfig, PixelFormat};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STUB_OBJECT_LABELS: &str = "person\nbicycle\ncar\ndog\ncup\n";
const STUB_ACTION_LABELS: &str = "walking\nrunning\nwaving\nsitting\n";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// Scripted in-process models
    Stub,
    /// ONNX Runtime (requires the `onnx` feature)
    Onnx,
}

#[derive(Parser)]
#[command(name = "sightline-replay")]
#[command(about = "Replay synthetic camera frames through the perception pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Pipeline configuration file (JSON or TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Number of frames to produce
    #[arg(long, default_value = "120")]
    frames: u32,

    /// Producer frame rate
    #[arg(long, default_value = "30")]
    fps: u32,

    #[arg(long, default_value = "1280")]
    width: u32,

    #[arg(long, default_value = "720")]
    height: u32,

    #[arg(long, value_enum, default_value = "stub")]
    backend: Backend,

    /// Simulated latency of one stub inference pass
    #[arg(long, default_value = "40")]
    stub_latency_ms: u64,

    /// Object model file inside the model directory
    #[arg(long)]
    object_model: Option<String>,

    #[arg(long)]
    object_labels: Option<String>,

    /// Expected SHA-256 of the object model
    #[arg(long)]
    object_checksum: Option<String>,

    #[arg(long)]
    action_model: Option<String>,

    #[arg(long)]
    action_labels: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    check_dimensions(cli.width, cli.height)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.apply_env();
    config.validate().context("invalid pipeline configuration")?;

    let (backend, object, action) = match cli.backend {
        Backend::Stub => stub_models(&cli, &config),
        Backend::Onnx => onnx_models(&cli, &config)?,
    };

    let scheduler = InferenceScheduler::initialize(config, backend, object, action)
        .await
        .context("failed to initialize the perception pipeline")?;
    let mut results = scheduler
        .take_results()
        .context("result stream already taken")?;

    let printer = tokio::spawn(async move {
        let mut printed = 0u64;
        while let Some(result) = results.recv().await {
            match serde_json::to_string(&result) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Could not serialize result {}: {}", result.sequence, e),
            }
            printed += 1;
        }
        printed
    });

    let fps = cli.fps.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / fps as f64));
    let (mut admitted, mut dropped) = (0u32, 0u32);
    for index in 0..cli.frames {
        ticker.tick().await;
        let frame = synthetic_frame(cli.width, cli.height, index)?;
        match scheduler.submit(frame) {
            Admission::Admitted(_) => admitted += 1,
            Admission::Dropped => dropped += 1,
            Admission::Disposed => break,
        }
    }
    info!("Produced {} frames: {} admitted, {} dropped", cli.frames, admitted, dropped);

    // Let the last admitted frame finish before shutting down
    while scheduler.state() != sightline_eye::SchedulerState::Idle {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let status = scheduler.status();
    scheduler.dispose().await;
    drop(scheduler);

    let printed = printer.await.context("result printer failed")?;
    info!("Printed {} results", printed);
    info!("Final status: {}", serde_json::to_string(&status)?);
    Ok(())
}

fn check_dimensions(width: u32, height: u32) -> anyhow::Result<()> {
    anyhow::ensure!(width > 0 && height > 0, "frame size {}x{} must be non-zero", width, height);
    anyhow::ensure!(
        width <= MAX_FRAME_EDGE && height <= MAX_FRAME_EDGE,
        "frame size {}x{} exceeds the {} px edge limit",
        width,
        height,
        MAX_FRAME_EDGE
    );
    Ok(())
}

/// Moving gray square on a horizontal gradient
fn synthetic_frame(width: u32, height: u32, index: u32) -> anyhow::Result<Frame> {
    check_dimensions(width, height)?;
    let side = (width.min(height) / 4).max(1);
    let x0 = index.wrapping_mul(8) % width.saturating_sub(side).max(1);
    let y0 = (height - side) / 2;

    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        for x in 0..width {
            let inside = x >= x0 && x < x0 + side && y >= y0 && y < y0 + side;
            let shade = if inside { 200 } else { (x * 255 / width.max(1)) as u8 };
            data.extend_from_slice(&[shade, shade / 2, 255 - shade, 255]);
        }
    }
    Ok(Frame::packed(width, height, PixelFormat::Rgba8888, data, Utc::now())?)
}

type Models = (Arc<dyn InferenceBackend>, ModelSource, Option<ModelSource>);

fn stub_models(cli: &Cli, config: &PipelineConfig) -> Models {
    let latency = Duration::from_millis(cli.stub_latency_ms);
    let object_labels = LabelTable::parse(STUB_OBJECT_LABELS);
    let action_labels = LabelTable::parse(STUB_ACTION_LABELS);
    let classes = object_labels.len();
    let actions = action_labels.len();
    let size = config.object.input_size as f32;

    // One box sweeping across the canvas, cycling through the classes
    let object = StubModel::from_fn(move |call, _| {
        let mut row = vec![0.0f32; 4 + classes];
        row[0] = (call as f32 * 8.0) % size;
        row[1] = size / 2.0;
        row[2] = size / 4.0;
        row[3] = size / 4.0;
        row[4 + call % classes] = 0.9;
        row
    })
    .with_delay(latency);

    // Strongly favour one action per run, rotating
    let action = StubModel::from_fn(move |call, _| {
        (0..actions).map(|i| if i == call % actions { 4.0 } else { 0.0 }).collect()
    })
    .with_delay(latency);

    let backend = StubBackend::new()
        .with_model("object", object)
        .with_model("action", action);

    (
        Arc::new(backend),
        ModelSource::new("object", b"object".to_vec(), object_labels),
        Some(ModelSource::new("action", b"action".to_vec(), action_labels)),
    )
}

#[cfg(feature = "onnx")]
fn onnx_models(cli: &Cli, config: &PipelineConfig) -> anyhow::Result<Models> {
    let store = ModelStore::new(&config.model_path);
    let object_model = cli.object_model.as_deref().context("--object-model is required for onnx")?;
    let object_labels = cli.object_labels.as_deref().context("--object-labels is required for onnx")?;
    let object = store.load_source(object_model, object_labels, cli.object_checksum.as_deref())?;

    let action = match (cli.action_model.as_deref(), cli.action_labels.as_deref()) {
        (Some(model), Some(labels)) => match store.load_source(model, labels, None) {
            Ok(source) => Some(source),
            Err(e) => {
                warn!("Action model unavailable: {}", e);
                None
            }
        },
        _ => None,
    };

    let backend: Arc<dyn InferenceBackend> = Arc::new(sightline_eye::models::OnnxBackend::new());
    Ok((backend, object, action))
}

#[cfg(not(feature = "onnx"))]
fn onnx_models(_cli: &Cli, config: &PipelineConfig) -> anyhow::Result<Models> {
    let store = ModelStore::new(&config.model_path);
    anyhow::bail!(
        "the onnx backend is not compiled in; rebuild with --features onnx (model directory {})",
        store.root().display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_frame_rejects_bad_sizes() {
        assert!(synthetic_frame(64, 0, 0).is_err());
        assert!(synthetic_frame(0, 64, 0).is_err());
        assert!(synthetic_frame(MAX_FRAME_EDGE + 1, 64, 0).is_err());
        assert!(synthetic_frame(u32::MAX, u32::MAX, 0).is_err());
    }

    #[test]
    fn test_synthetic_frame_small_and_late_index() {
        let frame = synthetic_frame(1, 1, u32::MAX).unwrap();
        assert_eq!((frame.width(), frame.height()), (1, 1));
        let frame = synthetic_frame(64, 48, 1000).unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));
    }
}
