//! Demo entry point: a synthetic camera publisher wired to the capture
//! worker through the in-process bus. Useful for exercising the pipeline
//! end to end without hardware and as a template for real integrations.

use anyhow::{Context, Result};
use clap::Parser;
use movie_saver::{
    BusMessage, ChannelSource, FrameGeometry, MovieReader, MovieSaver, PixelFormat, SaverConfig,
};
use rand::Rng;
use serde_json::json;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "movie-saver", about = "Capture a synthetic camera stream to disk")]
struct Cli {
    /// TOML config file; overrides the individual flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output store file.
    #[arg(long, default_value = "movie.msv")]
    output: PathBuf,

    /// Number of synthetic frames to publish.
    #[arg(long, default_value_t = 200)]
    frames: u64,

    /// Frame rate of the synthetic camera.
    #[arg(long, default_value_t = 200.0)]
    fps: f64,

    /// Frame width in pixels.
    #[arg(long, default_value_t = 64)]
    width: u32,

    /// Frame height in pixels.
    #[arg(long, default_value_t = 48)]
    height: u32,

    /// Staging memory budget in bytes.
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    memory_budget: u64,
}

const TOPIC: &str = "camera.frames";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SaverConfig::from_toml_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SaverConfig::builder(&cli.output)
            .memory_budget_bytes(cli.memory_budget)
            .frame_rate(cli.fps)
            .topic(TOPIC)
            .metadata("camera", json!("synthetic"))
            .metadata("exposure", json!("1 ms"))
            .build()?,
    };
    let output_path = config.output_path.clone();
    let topic = if config.topic.is_empty() {
        TOPIC.to_string()
    } else {
        config.topic.clone()
    };

    let (tx, source) = ChannelSource::pair(&config.topic);
    let geometry = FrameGeometry::new(cli.width, cli.height, PixelFormat::U16);
    let fps = cli.fps;
    let n_frames = cli.frames;
    let producer = thread::spawn(move || publish_synthetic(&tx, &topic, geometry, n_frames, fps));

    let handle = MovieSaver::new(config, source)?.spawn();

    producer
        .join()
        .map_err(|_| anyhow::anyhow!("publisher thread panicked"))?;
    let report = handle.join()?;
    info!(
        frames = report.frames_written,
        blocks = report.blocks_flushed,
        dropped = report.frames_dropped,
        loss_events = report.loss_events,
        "capture finished"
    );

    if report.frames_written > 0 {
        let reader = MovieReader::open(&output_path)?;
        info!(
            path = %output_path.display(),
            frames = reader.frames(),
            geometry = %reader.geometry(),
            allocate = reader.allocate(),
            "store verified readable"
        );
    }
    Ok(())
}

/// Publish gradient-plus-noise frames at the nominal rate, then the in-band
/// stop message, the way the camera process ends a recording.
fn publish_synthetic(
    tx: &UnboundedSender<BusMessage>,
    topic: &str,
    geometry: FrameGeometry,
    n_frames: u64,
    fps: f64,
) {
    let mut rng = rand::thread_rng();
    let interval_ps = (1e12 / fps).round() as u64;
    let pixels = geometry.dim0 as usize * geometry.dim1 as usize;

    for i in 0..n_frames {
        let mut payload = Vec::with_capacity(pixels * 2);
        for p in 0..pixels {
            let value = ((p as u64 + i) % 4096) as u16 + rng.gen_range(0..32u16);
            payload.extend_from_slice(&value.to_le_bytes());
        }
        let msg = BusMessage::data(topic, geometry, i * interval_ps, payload);
        if tx.send(msg).is_err() {
            return;
        }
        thread::sleep(Duration::from_secs_f64(1.0 / fps));
    }

    let _ = tx.send(BusMessage::stop(topic));
}
