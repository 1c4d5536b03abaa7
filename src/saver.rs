//! Capture loop and worker lifecycle.
//!
//! `MovieSaver` is the background worker that drains a frame subscription to
//! disk:
//!
//! ```text
//! camera process ──bus──▶ FrameSource ──▶ capture loop ──▶ StagingBuffer
//!                                             │                 │ (full)
//!                                             ▼                 ▼
//!                                      FrameLossDetector    MovieStore
//! ```
//!
//! Lifecycle: `Idle → Connected → Running → Draining → Closed`. The loop
//! polls without blocking and sleeps a short backoff when idle, so stop
//! requests are observed within one iteration. The termination triggers
//! (external stop flag, in-band stop message, producer disconnecting) are
//! equivalent and tolerated at any point, including before the first
//! frame. Draining always flushes whatever is staged and finalizes the
//! store, even on the fatal path, so the file stays readable and correctly
//! sized for everything written before a fault.

use crate::codec::{self, Decoded, Frame};
use crate::config::SaverConfig;
use crate::error::{Result, SaverError};
use crate::loss::{FrameLossDetector, LossWarning};
use crate::source::FrameSource;
use crate::staging::StagingBuffer;
use crate::store::MovieStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Lifecycle states of the capture worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaverState {
    Idle,
    Connected,
    Running,
    Draining,
    Closed,
}

/// Terminal accounting for a clean run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaverReport {
    /// Frames persisted to the store (0 when no frame ever arrived).
    pub frames_written: u64,
    /// Blocks appended, including the final partial one.
    pub blocks_flushed: u64,
    /// Malformed messages dropped.
    pub frames_dropped: u64,
    /// Loss-detector warnings (gaps and non-monotonic stamps).
    pub loss_events: u64,
    /// Terminal state; always [`SaverState::Closed`] on a clean run.
    pub state: SaverState,
}

/// Clonable stop trigger for a running worker.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Request a cooperative stop; takes effect at the next loop iteration.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle to a spawned capture worker.
#[derive(Debug)]
pub struct SaverHandle {
    stop: StopHandle,
    thread: JoinHandle<Result<SaverReport>>,
}

impl SaverHandle {
    /// Request a cooperative stop.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the worker and return its report or fatal error.
    pub fn join(self) -> Result<SaverReport> {
        match self.thread.join() {
            Ok(result) => result,
            Err(panic) => {
                warn!(?panic, "capture worker panicked");
                Err(SaverError::WorkerPanicked)
            }
        }
    }
}

/// Staging buffer plus its store, created together on the first data frame
/// (frame geometry is unknown until then) and torn down together at close.
struct Pipeline {
    staging: StagingBuffer,
    store: MovieStore,
}

impl Pipeline {
    fn create(config: &SaverConfig, frame: &Frame) -> Result<Self> {
        let staging = StagingBuffer::allocate(frame.geometry, config.memory_budget_bytes)?;
        info!(
            geometry = %frame.geometry,
            capacity = staging.capacity(),
            "allocated staging buffer"
        );
        let store = MovieStore::create(
            &config.output_path,
            frame.geometry,
            staging.capacity() as u64,
            config.frame_rate,
            &config.metadata,
        )?;
        Ok(Self { staging, store })
    }
}

/// Background worker that captures a frame stream into a movie store.
pub struct MovieSaver<S> {
    config: SaverConfig,
    source: S,
    detector: FrameLossDetector,
    stop: Arc<AtomicBool>,
    state: SaverState,
    blocks_flushed: u64,
    frames_dropped: u64,
    loss_events: u64,
}

impl<S: FrameSource> MovieSaver<S> {
    /// Create a worker from a validated config and a frame subscription.
    pub fn new(config: SaverConfig, source: S) -> Result<Self> {
        config.validate()?;
        let nominal = config.nominal_interval_ps();
        let detector = match config.loss_threshold_ps {
            Some(threshold) => FrameLossDetector::with_threshold(nominal, threshold),
            None => FrameLossDetector::new(nominal),
        };
        Ok(Self {
            config,
            source,
            detector,
            stop: Arc::new(AtomicBool::new(false)),
            state: SaverState::Idle,
            blocks_flushed: 0,
            frames_dropped: 0,
            loss_events: 0,
        })
    }

    /// External stop trigger for this worker.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    pub fn state(&self) -> SaverState {
        self.state
    }

    /// Run the capture loop on the current thread until a stop trigger or a
    /// fatal error, then drain and close.
    pub fn run(mut self) -> Result<SaverReport> {
        self.state = SaverState::Connected;
        info!(
            bus = %self.config.bus_url,
            topic = %self.config.topic,
            output = %self.config.output_path.display(),
            "capture worker connected"
        );

        self.state = SaverState::Running;
        let mut pipeline: Option<Pipeline> = None;

        let outcome = loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("external stop observed");
                break Ok(());
            }

            let msg = match self.source.poll() {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    thread::sleep(self.config.poll_backoff);
                    continue;
                }
                Err(SaverError::SourceDisconnected) => {
                    info!("frame source disconnected, draining");
                    break Ok(());
                }
                Err(e) => break Err(e),
            };

            let frame = match codec::decode(msg) {
                Ok(Decoded::Stop) => {
                    info!("in-band stop message received");
                    break Ok(());
                }
                Ok(Decoded::Frame(frame)) => frame,
                Err(e) => {
                    warn!(error = %e, "dropping malformed message");
                    self.frames_dropped += 1;
                    continue;
                }
            };

            self.observe_timestamp(&frame);

            if let Err(e) = self.ingest(frame, &mut pipeline) {
                break Err(e);
            }
        };

        self.state = SaverState::Draining;
        let drained = self.drain_and_close(pipeline);
        self.state = SaverState::Closed;

        // A loop fault outranks a drain fault; either way the drain already
        // salvaged whatever it could onto disk.
        let frames_written = match (outcome, drained) {
            (Err(e), _) => return Err(e),
            (Ok(()), Err(e)) => return Err(e),
            (Ok(()), Ok(frames)) => frames,
        };

        let report = SaverReport {
            frames_written,
            blocks_flushed: self.blocks_flushed,
            frames_dropped: self.frames_dropped,
            loss_events: self.loss_events,
            state: self.state,
        };
        info!(
            frames = report.frames_written,
            blocks = report.blocks_flushed,
            dropped = report.frames_dropped,
            loss_events = report.loss_events,
            "capture worker closed"
        );
        Ok(report)
    }

    fn observe_timestamp(&mut self, frame: &Frame) {
        if let Some(warning) = self.detector.observe(frame.timestamp) {
            self.loss_events += 1;
            match &warning {
                LossWarning::Gap { .. } => {
                    warn!(timestamp = frame.timestamp, "{warning}");
                    debug!(window = ?self.detector.window_snapshot(), "timestamps around the gap");
                }
                LossWarning::NonMonotonic { .. } => {
                    warn!(timestamp = frame.timestamp, "{warning}");
                }
            }
        }
    }

    /// Admit one frame: lazily create the pipeline, flush a full block
    /// first, then stage the frame.
    fn ingest(&mut self, frame: Frame, pipeline: &mut Option<Pipeline>) -> Result<()> {
        let p = match pipeline {
            Some(p) => p,
            None => pipeline.insert(Pipeline::create(&self.config, &frame)?),
        };

        if p.staging.is_full() {
            let staged = p.staging.len();
            let generation = p.staging.generation();
            let block = p.staging.drain(staged);
            p.store.append_block(block, staged as u64)?;
            self.blocks_flushed += 1;
            debug!(frames = staged, generation, "flushed full block");
        }

        let slot = p.staging.write(&frame)?;
        trace!(slot, timestamp = frame.timestamp, "staged frame");
        Ok(())
    }

    /// Flush the staged remainder and finalize the store. With no pipeline
    /// (no frame ever admitted) there is nothing on disk to close; the
    /// worker still reports a clean zero-frame run.
    fn drain_and_close(&mut self, pipeline: Option<Pipeline>) -> Result<u64> {
        let Some(Pipeline { mut staging, mut store }) = pipeline else {
            info!("closing with no frames admitted, no store created");
            return Ok(0);
        };

        let mut first_err: Option<SaverError> = None;
        let staged = staging.len();
        if staged > 0 {
            info!(frames = staged, "flushing final partial block");
            let block = staging.drain(staged);
            match store.append_block(block, staged as u64) {
                Ok(()) => self.blocks_flushed += 1,
                Err(e) => first_err = Some(e),
            }
        }

        match (store.finalize(), first_err) {
            (_, Some(e)) => Err(e),
            (Err(e), None) => Err(e),
            (Ok(total), None) => Ok(total),
        }
    }
}

impl<S: FrameSource + 'static> MovieSaver<S> {
    /// Launch the worker on a dedicated thread.
    pub fn spawn(self) -> SaverHandle {
        let stop = self.stop_handle();
        let thread = thread::Builder::new()
            .name("movie-saver".to_string())
            .spawn(move || self.run())
            .unwrap_or_else(|e| {
                // Thread spawn only fails on resource exhaustion; surface it
                // through the handle instead of panicking here.
                let err = SaverError::Io(e);
                thread::spawn(move || Err(err))
            });
        SaverHandle { stop, thread }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BusMessage;
    use crate::source::ChannelSource;
    use std::collections::VecDeque;

    /// Scripted source: plays back a fixed message sequence, then reports
    /// the producer gone.
    struct ScriptedSource {
        messages: VecDeque<BusMessage>,
    }

    impl FrameSource for ScriptedSource {
        fn poll(&mut self) -> Result<Option<BusMessage>> {
            match self.messages.pop_front() {
                Some(msg) => Ok(Some(msg)),
                None => Err(SaverError::SourceDisconnected),
            }
        }
    }

    fn config(dir: &tempfile::TempDir, budget: u64) -> SaverConfig {
        SaverConfig::builder(dir.path().join("movie.msv"))
            .memory_budget_bytes(budget)
            .frame_rate(200.0)
            .topic("camera.frames")
            .build()
            .unwrap()
    }

    #[test]
    fn test_stop_with_zero_frames_closes_cleanly() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = config(&dir, 1024);
        let output = cfg.output_path.clone();

        let source = ScriptedSource {
            messages: [BusMessage::stop("camera.frames")].into(),
        };
        let report = MovieSaver::new(cfg, source).unwrap().run().unwrap();

        assert_eq!(report.frames_written, 0);
        assert_eq!(report.state, SaverState::Closed);
        assert!(!output.exists(), "no store file for a zero-frame run");
    }

    #[test]
    fn test_external_stop_before_connect_is_honored() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_tx, source) = ChannelSource::pair("camera.frames");
        let saver = MovieSaver::new(config(&dir, 1024), source).unwrap();
        saver.stop_handle().stop();

        let report = saver.run().unwrap();
        assert_eq!(report.frames_written, 0);
        assert_eq!(report.state, SaverState::Closed);
    }
}
