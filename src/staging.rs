//! Bounded in-memory staging for frames awaiting a disk flush.
//!
//! The buffer is one contiguous allocation of `capacity` frame slots, sized
//! once from the memory budget. The capture loop (the single writer) fills
//! slots in order and drains the valid prefix into the store when the buffer
//! is full or the run ends. Draining resets the write cursor so the same
//! allocation is reused for the next block; a generation counter tells
//! successive fills apart.

use crate::codec::{Frame, FrameGeometry};
use crate::error::{Result, SaverError};

/// Preallocated block of frame slots between the bus and the store.
///
/// Invariant: `0 <= cursor <= capacity`. The geometry is fixed at
/// allocation; a frame with any other geometry poisons the buffer and every
/// later write is rejected.
#[derive(Debug)]
pub struct StagingBuffer {
    geometry: FrameGeometry,
    frame_bytes: usize,
    capacity: usize,
    block: Vec<u8>,
    cursor: usize,
    generation: u64,
    poisoned: bool,
}

impl StagingBuffer {
    /// Allocate a buffer holding `max(1, memory_budget_bytes / frame_bytes)`
    /// frames of the given geometry.
    pub fn allocate(geometry: FrameGeometry, memory_budget_bytes: u64) -> Result<Self> {
        let frame_bytes = geometry.frame_bytes();
        if frame_bytes == 0 {
            return Err(SaverError::invalid_config(format!(
                "zero-sized frame geometry {geometry}"
            )));
        }
        if memory_budget_bytes == 0 {
            return Err(SaverError::invalid_config(
                "memory budget must be non-zero",
            ));
        }

        let capacity = ((memory_budget_bytes / frame_bytes as u64) as usize).max(1);

        Ok(Self {
            geometry,
            frame_bytes,
            capacity,
            block: vec![0u8; capacity * frame_bytes],
            cursor: 0,
            generation: 0,
            poisoned: false,
        })
    }

    /// Number of frame slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently staged.
    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Whether the next write requires a flush first.
    pub fn is_full(&self) -> bool {
        self.cursor == self.capacity
    }

    /// Completed fills drained so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Copy a frame into the next slot, returning the slot index.
    ///
    /// Errors with [`SaverError::GeometryMismatch`] if the frame does not
    /// match the allocation geometry (and permanently afterwards), or
    /// [`SaverError::BufferFull`] if called without an intervening drain.
    pub fn write(&mut self, frame: &Frame) -> Result<usize> {
        if self.poisoned || frame.geometry != self.geometry {
            self.poisoned = true;
            return Err(SaverError::GeometryMismatch {
                expected: self.geometry,
                actual: frame.geometry,
            });
        }
        if self.cursor == self.capacity {
            return Err(SaverError::BufferFull {
                capacity: self.capacity,
            });
        }
        debug_assert_eq!(frame.payload.len(), self.frame_bytes);

        let slot = self.cursor;
        let start = slot * self.frame_bytes;
        self.block[start..start + self.frame_bytes].copy_from_slice(&frame.payload);
        self.cursor += 1;
        Ok(slot)
    }

    /// Return a read-only view of the first `count` staged frames and reset
    /// the cursor for reuse. `count` is clamped to the staged length.
    pub fn drain(&mut self, count: usize) -> &[u8] {
        let count = count.min(self.cursor);
        self.cursor = 0;
        self.generation += 1;
        &self.block[..count * self.frame_bytes]
    }
}
