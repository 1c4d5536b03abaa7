//! Streaming camera frame capture-to-disk pipeline.
//!
//! This crate implements the movie-saving worker of a laboratory acquisition
//! setup: a camera process publishes frames over a message bus, and this
//! worker subscribes, stages frames in a bounded in-memory buffer, flushes
//! completed blocks into a growable on-disk array and detects dropped frames
//! from hardware timestamp gaps. Stopping (an external flag, an in-band
//! control message, or the producer going away) drains any partial block and
//! finalizes the file's metadata record.
//!
//! # Architecture
//!
//! ```text
//! camera process (external)
//!        │ topic + JSON metadata + raw payload
//!        ▼
//!   FrameSource ──▶ codec ──▶ capture loop ──▶ StagingBuffer ──▶ MovieStore
//!   (swappable bus)              │                (memory-budget   (growable
//!                                ▼                 sized block)     on-disk
//!                         FrameLossDetector                         array)
//! ```
//!
//! The worker owns the staging buffer and the store exclusively; the only
//! shared state with the outside is the frame channel and the stop flag.
//! Frames are persisted strictly in arrival order.
//!
//! # Example
//!
//! ```no_run
//! use movie_saver::{ChannelSource, MovieSaver, SaverConfig};
//!
//! # fn main() -> movie_saver::Result<()> {
//! let config = SaverConfig::builder("run_042.msv")
//!     .memory_budget_bytes(64 * 1024 * 1024)
//!     .frame_rate(120.0)
//!     .topic("camera.frames")
//!     .build()?;
//!
//! let (tx, source) = ChannelSource::pair("camera.frames");
//! let handle = MovieSaver::new(config, source)?.spawn();
//!
//! // ... the camera process publishes frames through `tx` ...
//!
//! handle.stop();
//! let report = handle.join()?;
//! println!("saved {} frames", report.frames_written);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod loss;
pub mod reader;
pub mod saver;
pub mod source;
pub mod staging;
pub mod store;

pub use codec::{decode, BusMessage, Decoded, Frame, FrameGeometry, PixelFormat};
pub use config::{SaverConfig, SaverConfigBuilder};
pub use error::{Result, SaverError};
pub use loss::{FrameLossDetector, LossWarning, TimestampWindow, TIMESTAMP_WINDOW};
pub use reader::MovieReader;
pub use saver::{MovieSaver, SaverHandle, SaverReport, SaverState, StopHandle};
pub use source::{ChannelSource, FrameSource};
pub use staging::StagingBuffer;
pub use store::{MovieStore, StoreMetadata};
