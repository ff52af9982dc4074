//! Contiguous buffer arena.
//!
//! One allocation, sliced into fixed-size buffers addressed by byte offset.
//! Freed offsets go on a stack and are handed out again before any new
//! region is carved, so the arena never grows or fragments under connection
//! turnover.
//!
//! The arena has no locking of its own. The owner serializes access.

use crate::config::ConfigError;
use crate::error::{Result, ServerError};

/// Fixed-capacity byte arena handing out `slice_size` buffers.
pub struct BufferArena {
    /// Backing storage, allocated once.
    storage: Box<[u8]>,
    /// Size of every slice.
    slice_size: usize,
    /// Stack of released offsets (LIFO for cache locality).
    free_offsets: Vec<usize>,
    /// First byte never handed out.
    next_offset: usize,
}

impl BufferArena {
    /// Reserve `capacity` bytes to be handed out in `slice_size` pieces.
    ///
    /// Any tail smaller than one slice is never used.
    pub fn new(capacity: usize, slice_size: usize) -> Result<Self> {
        if slice_size == 0 || capacity < slice_size {
            return Err(ConfigError::Invalid("buffer arena must hold at least one slice").into());
        }

        Ok(Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            slice_size,
            free_offsets: Vec::with_capacity(capacity / slice_size),
            next_offset: 0,
        })
    }

    /// Hand out a slice offset.
    ///
    /// Reuses the most recently released offset when there is one.
    pub fn checkout(&mut self) -> Result<usize> {
        if let Some(offset) = self.free_offsets.pop() {
            return Ok(offset);
        }

        if self.next_offset + self.slice_size > self.storage.len() {
            return Err(ServerError::ArenaExhausted {
                capacity: self.storage.len(),
                slice_size: self.slice_size,
            });
        }

        let offset = self.next_offset;
        self.next_offset += self.slice_size;
        Ok(offset)
    }

    /// Return a slice to the arena.
    ///
    /// Releasing the same offset twice is a caller bug and is not detected.
    pub fn release(&mut self, offset: usize) {
        debug_assert!(offset < self.next_offset, "offset was never issued");
        debug_assert_eq!(offset % self.slice_size, 0, "misaligned offset");
        self.free_offsets.push(offset);
    }

    /// Borrow the slice starting at `offset`.
    ///
    /// # Panics
    /// Panics if the slice lies outside the storage.
    pub fn slice(&self, offset: usize) -> &[u8] {
        &self.storage[offset..offset + self.slice_size]
    }

    /// Mutably borrow the slice starting at `offset`.
    ///
    /// # Panics
    /// Panics if the slice lies outside the storage.
    pub fn slice_mut(&mut self, offset: usize) -> &mut [u8] {
        &mut self.storage[offset..offset + self.slice_size]
    }

    /// Total bytes reserved.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    /// Number of slices currently handed out.
    pub fn live(&self) -> usize {
        self.next_offset / self.slice_size - self.free_offsets.len()
    }

    /// Number of slices that can still be checked out.
    pub fn free(&self) -> usize {
        self.free_offsets.len() + (self.storage.len() - self.next_offset) / self.slice_size
    }
}
