//! Wire codec for camera frame messages.
//!
//! The camera process publishes each frame as a three-part message: a topic
//! string, a JSON metadata record and a raw byte payload. This module turns
//! such a message into either a typed [`Frame`] or an in-band [`Decoded::Stop`]
//! control signal, validating the metadata and the payload length on the way.
//!
//! # Byte layout
//!
//! Payloads arrive in the producer's native memory order, which is
//! column-major (Fortran order) for the cameras feeding this pipeline. That
//! ordering is a cross-process contract: the codec validates the byte count
//! and passes the payload through untouched, and the store persists it
//! verbatim. Reordering here would transpose every saved image.

use crate::error::{Result, SaverError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Element type of a single pixel, named after the producer's dtype strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl PixelFormat {
    /// Parse a numpy-style dtype string (e.g. `"uint16"`).
    pub fn from_dtype(dtype: &str) -> Option<Self> {
        match dtype {
            "uint8" | "u1" => Some(Self::U8),
            "uint16" | "u2" => Some(Self::U16),
            "uint32" | "u4" => Some(Self::U32),
            "uint64" | "u8" => Some(Self::U64),
            "int8" | "i1" => Some(Self::I8),
            "int16" | "i2" => Some(Self::I16),
            "int32" | "i4" => Some(Self::I32),
            "int64" | "i8" => Some(Self::I64),
            "float32" | "f4" => Some(Self::F32),
            "float64" | "f8" => Some(Self::F64),
            _ => None,
        }
    }

    /// Canonical dtype name as the producer spells it.
    pub fn dtype(&self) -> &'static str {
        match self {
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::U64 => "uint64",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }

    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// Stable numeric code used in the store header.
    pub(crate) fn code(&self) -> u32 {
        match self {
            Self::U8 => 0,
            Self::U16 => 1,
            Self::U32 => 2,
            Self::U64 => 3,
            Self::I8 => 4,
            Self::I16 => 5,
            Self::I32 => 6,
            Self::I64 => 7,
            Self::F32 => 8,
            Self::F64 => 9,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::U8),
            1 => Some(Self::U16),
            2 => Some(Self::U32),
            3 => Some(Self::U64),
            4 => Some(Self::I8),
            5 => Some(Self::I16),
            6 => Some(Self::I32),
            7 => Some(Self::I64),
            8 => Some(Self::F32),
            9 => Some(Self::F64),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dtype())
    }
}

/// Shape and element type of a frame. Fixed for a run by the first admitted
/// data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub dim0: u32,
    pub dim1: u32,
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub fn new(dim0: u32, dim1: u32, format: PixelFormat) -> Self {
        Self { dim0, dim1, format }
    }

    /// Byte size of one frame: `dim0 × dim1 × element size`.
    pub fn frame_bytes(&self) -> usize {
        self.dim0 as usize * self.dim1 as usize * self.format.size()
    }
}

impl fmt::Display for FrameGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.dim0, self.dim1, self.format)
    }
}

/// A message as it arrives from the bus: topic, JSON metadata, raw payload.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub metadata: serde_json::Value,
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Build a data-frame message the way the camera publisher does.
    pub fn data(
        topic: impl Into<String>,
        geometry: FrameGeometry,
        timestamp: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            topic: topic.into(),
            metadata: json!({
                "dtype": geometry.format.dtype(),
                "shape": [geometry.dim0, geometry.dim1],
                "timestamp": timestamp,
                "numpy": true,
            }),
            payload,
        }
    }

    /// Build an in-band stop message (`numpy: false`, no payload).
    pub fn stop(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            metadata: json!({ "numpy": false }),
            payload: Vec::new(),
        }
    }
}

/// A decoded camera frame. Payload bytes are column-major, exactly as
/// produced; ownership moves once into the staging slot that admits it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub geometry: FrameGeometry,
    /// Hardware timestamp in picoseconds.
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

/// Outcome of decoding one bus message.
#[derive(Debug)]
pub enum Decoded {
    Frame(Frame),
    /// In-band termination signal.
    Stop,
}

/// Metadata fields required on every data frame.
#[derive(Debug, Deserialize)]
struct WireMeta {
    dtype: String,
    shape: (u32, u32),
    timestamp: u64,
}

/// Decode a bus message into a data frame or a control signal.
///
/// The `numpy` discriminator decides which: present and `false` means stop,
/// regardless of the declared topic. A missing or non-boolean discriminator
/// is a [`SaverError::MalformedFrame`], not a stop: a producer that cannot
/// spell the discriminator cannot be trusted to mean "terminate".
pub fn decode(msg: BusMessage) -> Result<Decoded> {
    let meta = msg
        .metadata
        .as_object()
        .ok_or_else(|| SaverError::malformed("metadata is not a JSON object"))?;

    let numpy = meta
        .get("numpy")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| SaverError::malformed("missing or non-boolean 'numpy' discriminator"))?;

    if !numpy {
        return Ok(Decoded::Stop);
    }

    let wire: WireMeta = serde_json::from_value(msg.metadata)
        .map_err(|e| SaverError::malformed(format!("bad frame metadata: {e}")))?;

    let format = PixelFormat::from_dtype(&wire.dtype)
        .ok_or_else(|| SaverError::malformed(format!("unsupported dtype '{}'", wire.dtype)))?;

    let (dim0, dim1) = wire.shape;
    if dim0 == 0 || dim1 == 0 {
        return Err(SaverError::malformed(format!(
            "degenerate shape {dim0}x{dim1}"
        )));
    }

    let geometry = FrameGeometry::new(dim0, dim1, format);
    if msg.payload.len() != geometry.frame_bytes() {
        return Err(SaverError::malformed(format!(
            "payload is {} bytes, shape {} implies {}",
            msg.payload.len(),
            geometry,
            geometry.frame_bytes()
        )));
    }

    Ok(Decoded::Frame(Frame {
        geometry,
        timestamp: wire.timestamp,
        payload: msg.payload,
    }))
}
