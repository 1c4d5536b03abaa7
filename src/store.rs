//! Append-only on-disk movie store.
//!
//! One file per recording:
//!
//! ```text
//! +--------------------+---------------------------+------------------------+
//! | header (64 bytes)  | metadata JSON (reserved)  | frame data (growable)  |
//! +--------------------+---------------------------+------------------------+
//! ```
//!
//! The data region is a dense array of shape `(dim0, dim1, N)`: frame `i`
//! occupies bytes `[i * frame_bytes, (i + 1) * frame_bytes)` past the data
//! offset, stored column-major exactly as produced. `N` grows ahead in
//! block-capacity increments while full blocks stream in, and is truncated
//! to the exact frame count at finalize, so a finished file never carries
//! allocated-but-unwritten slots.
//!
//! Each append is one contiguous whole-block write. Frames arrive at camera
//! rate; the format trades compression for write throughput on purpose.
//!
//! The metadata record is a JSON document in a region reserved at creation.
//! It is written twice per file lifetime: seeded at creation (`fps`,
//! `start`, `allocate`, caller keys) and rewritten at finalize with `end`
//! and the final `frames` count.

use crate::codec::{FrameGeometry, PixelFormat};
use crate::error::{Result, SaverError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Magic number identifying a movie store file.
pub(crate) const MAGIC: u64 = 0x4D56_5344_0000_0001;

/// On-disk format version.
pub(crate) const VERSION: u32 = 1;

/// Size of the fixed binary header in bytes.
pub(crate) const HEADER_SIZE: u64 = 64;

/// Minimum bytes reserved for the metadata JSON region.
const META_REGION_MIN: u32 = 8192;

/// Keys owned by the store; caller-supplied metadata may not shadow them.
const RESERVED_META_KEYS: [&str; 5] = ["fps", "start", "end", "allocate", "frames"];

/// Fixed header at offset 0. All fields little-endian.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StoreHeader {
    pub format: PixelFormat,
    pub dim0: u32,
    pub dim1: u32,
    /// Block capacity in frames (`allocate` in the metadata record).
    pub allocate: u64,
    /// Running frame count; exact after finalize.
    pub frames: u64,
    /// Bytes reserved for the metadata JSON region.
    pub meta_capacity: u32,
    /// Current length of the metadata JSON document.
    pub meta_len: u32,
}

impl StoreHeader {
    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.format.code().to_le_bytes());
        buf[16..20].copy_from_slice(&self.dim0.to_le_bytes());
        buf[20..24].copy_from_slice(&self.dim1.to_le_bytes());
        buf[24..32].copy_from_slice(&self.allocate.to_le_bytes());
        buf[32..40].copy_from_slice(&self.frames.to_le_bytes());
        buf[40..44].copy_from_slice(&self.meta_capacity.to_le_bytes());
        buf[44..48].copy_from_slice(&self.meta_len.to_le_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Result<Self> {
        let magic = u64::from_le_bytes(buf[0..8].try_into().map_err(io_slice)?);
        if magic != MAGIC {
            return Err(SaverError::corrupt(format!(
                "bad magic 0x{magic:016X}, expected 0x{MAGIC:016X}"
            )));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().map_err(io_slice)?);
        if version != VERSION {
            return Err(SaverError::corrupt(format!(
                "unsupported store version {version}"
            )));
        }
        let code = u32::from_le_bytes(buf[12..16].try_into().map_err(io_slice)?);
        let format = PixelFormat::from_code(code)
            .ok_or_else(|| SaverError::corrupt(format!("unknown pixel format code {code}")))?;

        Ok(Self {
            format,
            dim0: u32::from_le_bytes(buf[16..20].try_into().map_err(io_slice)?),
            dim1: u32::from_le_bytes(buf[20..24].try_into().map_err(io_slice)?),
            allocate: u64::from_le_bytes(buf[24..32].try_into().map_err(io_slice)?),
            frames: u64::from_le_bytes(buf[32..40].try_into().map_err(io_slice)?),
            meta_capacity: u32::from_le_bytes(buf[40..44].try_into().map_err(io_slice)?),
            meta_len: u32::from_le_bytes(buf[44..48].try_into().map_err(io_slice)?),
        })
    }

    pub(crate) fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.dim0, self.dim1, self.format)
    }

    pub(crate) fn data_offset(&self) -> u64 {
        HEADER_SIZE + u64::from(self.meta_capacity)
    }
}

fn io_slice(_: std::array::TryFromSliceError) -> SaverError {
    SaverError::corrupt("header shorter than expected")
}

/// Metadata record stored alongside the frame array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Nominal frame rate of the recording.
    pub fps: f64,
    /// Wall-clock start, seconds since the unix epoch.
    pub start: f64,
    /// Block capacity the staging buffer was allocated with.
    pub allocate: u64,
    /// Wall-clock end; present after finalize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    /// Final frame count; present after finalize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<u64>,
    /// Caller-supplied keys, normalized to JSON primitives.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Coerce a caller-supplied metadata value to a primitive. Compound values
/// are stringified the way the original setup stringifies quantity objects.
fn normalize_meta_value(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        other => Value::String(other.to_string()),
    }
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Writer handle for a movie store file.
///
/// Owned exclusively by the capture loop: single writer, no concurrent
/// access. Geometry is fixed at creation for the lifetime of the file.
#[derive(Debug)]
pub struct MovieStore {
    file: File,
    path: PathBuf,
    geometry: FrameGeometry,
    frame_bytes: u64,
    block_capacity: u64,
    frames_written: u64,
    meta: StoreMetadata,
    meta_capacity: u32,
    data_offset: u64,
}

impl MovieStore {
    /// Create a store at `path`, seed its metadata record and preallocate
    /// the data region for one block of `block_capacity` frames.
    pub fn create(
        path: &Path,
        geometry: FrameGeometry,
        block_capacity: u64,
        fps: f64,
        user_metadata: &BTreeMap<String, Value>,
    ) -> Result<Self> {
        if geometry.frame_bytes() == 0 {
            return Err(SaverError::invalid_config(format!(
                "zero-sized frame geometry {geometry}"
            )));
        }
        if block_capacity == 0 {
            return Err(SaverError::invalid_config("block capacity must be non-zero"));
        }

        let extra: BTreeMap<String, Value> = user_metadata
            .iter()
            .filter(|(key, _)| !RESERVED_META_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), normalize_meta_value(value)))
            .collect();

        let meta = StoreMetadata {
            fps,
            start: unix_now(),
            allocate: block_capacity,
            end: None,
            frames: None,
            extra,
        };
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| SaverError::invalid_config(format!("unserializable metadata: {e}")))?;

        // Reserve slack so the finalize rewrite (adds `end` and `frames`)
        // always fits, rounded to a 1 KiB boundary.
        let needed = meta_bytes.len() as u32 + 1024;
        let meta_capacity = needed.next_multiple_of(1024).max(META_REGION_MIN);

        let frame_bytes = geometry.frame_bytes() as u64;
        let header = StoreHeader {
            format: geometry.format,
            dim0: geometry.dim0,
            dim1: geometry.dim1,
            allocate: block_capacity,
            frames: 0,
            meta_capacity,
            meta_len: meta_bytes.len() as u32,
        };
        let data_offset = header.data_offset();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&header.encode())?;
        file.write_all(&meta_bytes)?;
        file.set_len(data_offset + block_capacity * frame_bytes)?;

        info!(
            path = %path.display(),
            geometry = %geometry,
            allocate = block_capacity,
            "created movie store"
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            geometry,
            frame_bytes,
            block_capacity,
            frames_written: 0,
            meta,
            meta_capacity,
            data_offset,
        })
    }

    /// Append the valid prefix of a staged block at the current offset.
    ///
    /// A full block (`frames_in_block == block_capacity`) grows the data
    /// region one further block ahead; a partial block sizes it to exactly
    /// the frames written, so the final flush never leaves trailing
    /// uninitialized slots.
    pub fn append_block(&mut self, block: &[u8], frames_in_block: u64) -> Result<()> {
        if frames_in_block == 0 {
            return Ok(());
        }
        if frames_in_block > self.block_capacity
            || block.len() as u64 != frames_in_block * self.frame_bytes
        {
            return Err(SaverError::invalid_config(format!(
                "block of {} bytes does not hold {} frames of {} bytes",
                block.len(),
                frames_in_block,
                self.frame_bytes
            )));
        }

        self.file
            .seek(SeekFrom::Start(self.data_offset + self.frames_written * self.frame_bytes))?;
        self.file.write_all(block)?;

        self.frames_written += frames_in_block;
        let data_end = if frames_in_block == self.block_capacity {
            // Grow ahead for the next block while full blocks stream in.
            self.data_offset + (self.frames_written + self.block_capacity) * self.frame_bytes
        } else {
            self.data_offset + self.frames_written * self.frame_bytes
        };
        self.file.set_len(data_end)?;
        self.write_frame_count()?;

        debug!(
            frames = frames_in_block,
            total = self.frames_written,
            "appended block"
        );
        Ok(())
    }

    /// Truncate to the exact frame count, rewrite the metadata record with
    /// `end` and `frames`, sync and close. Returns the total frame count.
    ///
    /// Consuming `self` closes the file and makes a second finalize
    /// unrepresentable.
    pub fn finalize(mut self) -> Result<u64> {
        self.meta.end = Some(unix_now());
        self.meta.frames = Some(self.frames_written);
        let meta_bytes = serde_json::to_vec(&self.meta)
            .map_err(|e| SaverError::invalid_config(format!("unserializable metadata: {e}")))?;
        if meta_bytes.len() as u32 > self.meta_capacity {
            return Err(SaverError::invalid_config(
                "metadata record grew past its reserved region",
            ));
        }

        self.file
            .set_len(self.data_offset + self.frames_written * self.frame_bytes)?;
        self.file.seek(SeekFrom::Start(HEADER_SIZE))?;
        self.file.write_all(&meta_bytes)?;

        let header = StoreHeader {
            format: self.geometry.format,
            dim0: self.geometry.dim0,
            dim1: self.geometry.dim1,
            allocate: self.block_capacity,
            frames: self.frames_written,
            meta_capacity: self.meta_capacity,
            meta_len: meta_bytes.len() as u32,
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.sync_all()?;

        info!(
            path = %self.path.display(),
            frames = self.frames_written,
            "finalized movie store"
        );
        Ok(self.frames_written)
    }

    /// Frames appended so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn block_capacity(&self) -> u64 {
        self.block_capacity
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the header's running frame count current so a crash between
    /// appends still leaves a self-describing file.
    fn write_frame_count(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(32))?;
        self.file.write_all(&self.frames_written.to_le_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PixelFormat;
    use serde_json::json;
    use tempfile::TempDir;

    fn geometry() -> FrameGeometry {
        FrameGeometry::new(4, 3, PixelFormat::U16)
    }

    fn block(frames: u64, fill: u8) -> Vec<u8> {
        vec![fill; (frames as usize) * geometry().frame_bytes()]
    }

    #[test]
    fn test_create_preallocates_one_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.msv");
        let store =
            MovieStore::create(&path, geometry(), 4, 100.0, &BTreeMap::new()).unwrap();

        let expected = HEADER_SIZE
            + u64::from(store.meta_capacity)
            + 4 * geometry().frame_bytes() as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
        assert_eq!(store.frames_written(), 0);
    }

    #[test]
    fn test_full_block_grows_ahead_partial_block_sizes_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.msv");
        let mut store =
            MovieStore::create(&path, geometry(), 4, 100.0, &BTreeMap::new()).unwrap();
        let frame_bytes = geometry().frame_bytes() as u64;
        let data_offset = HEADER_SIZE + u64::from(store.meta_capacity);

        store.append_block(&block(4, 1), 4).unwrap();
        // Full block: region holds the written block plus one grown ahead.
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            data_offset + 8 * frame_bytes
        );

        store.append_block(&block(2, 2), 2).unwrap();
        // Partial block: sized to exactly the frames written.
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            data_offset + 6 * frame_bytes
        );

        let total = store.finalize().unwrap();
        assert_eq!(total, 6);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            data_offset + 6 * frame_bytes
        );
    }

    #[test]
    fn test_finalize_truncates_grown_region() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.msv");
        let mut store =
            MovieStore::create(&path, geometry(), 4, 100.0, &BTreeMap::new()).unwrap();
        store.append_block(&block(4, 7), 4).unwrap();

        let total = store.finalize().unwrap();
        assert_eq!(total, 4);

        // The grow-ahead slack is gone; only the 4 written frames remain.
        let len = std::fs::metadata(&path).unwrap().len();
        let mut header_buf = [0u8; HEADER_SIZE as usize];
        use std::io::Read;
        let mut f = File::open(&path).unwrap();
        f.read_exact(&mut header_buf).unwrap();
        let header = StoreHeader::decode(&header_buf).unwrap();
        assert_eq!(header.frames, 4);
        assert_eq!(
            len,
            header.data_offset() + 4 * geometry().frame_bytes() as u64
        );
    }

    #[test]
    fn test_metadata_seeded_and_finalized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.msv");
        let mut user = BTreeMap::new();
        user.insert("exposure".to_string(), json!("1 ms"));
        user.insert("gain".to_string(), json!(2.5));
        // Compound values are stringified, reserved keys dropped.
        user.insert("roi".to_string(), json!([0, 0, 4, 3]));
        user.insert("frames".to_string(), json!(999));

        let mut store = MovieStore::create(&path, geometry(), 4, 50.0, &user).unwrap();
        store.append_block(&block(3, 1), 3).unwrap();
        store.finalize().unwrap();

        let mut f = File::open(&path).unwrap();
        let mut header_buf = [0u8; HEADER_SIZE as usize];
        use std::io::Read;
        f.read_exact(&mut header_buf).unwrap();
        let header = StoreHeader::decode(&header_buf).unwrap();
        let mut meta_buf = vec![0u8; header.meta_len as usize];
        f.read_exact(&mut meta_buf).unwrap();
        let meta: StoreMetadata = serde_json::from_slice(&meta_buf).unwrap();

        assert_eq!(meta.fps, 50.0);
        assert_eq!(meta.allocate, 4);
        assert_eq!(meta.frames, Some(3));
        assert!(meta.end.unwrap_or(0.0) >= meta.start);
        assert_eq!(meta.extra.get("exposure"), Some(&json!("1 ms")));
        assert_eq!(meta.extra.get("gain"), Some(&json!(2.5)));
        assert_eq!(meta.extra.get("roi"), Some(&json!("[0,0,4,3]")));
        assert!(!meta.extra.contains_key("frames"));
    }

    #[test]
    fn test_append_rejects_mismatched_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.msv");
        let mut store =
            MovieStore::create(&path, geometry(), 4, 100.0, &BTreeMap::new()).unwrap();

        // Length does not match the claimed frame count.
        assert!(store.append_block(&block(2, 0), 3).is_err());
        // More frames than one block can hold.
        assert!(store.append_block(&block(5, 0), 5).is_err());
        // Empty append is a no-op.
        store.append_block(&[], 0).unwrap();
        assert_eq!(store.frames_written(), 0);
    }
}
