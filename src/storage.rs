//! Byte storage behind chunk buffers.
//!
//! A chunk server is generic over [`ChunkStorage`]: the storage hands out one
//! fixed-capacity [`ChunkRegion`] per chunk and accounts for the bytes it has
//! allocated. Ordering, cursors and replication live above this layer.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::common::ChunkId;
use crate::error::{PfsError, Result};

pub mod file;
pub mod memory;

pub use file::{FileRegion, FileStorage};
pub use memory::{MemoryRegion, MemoryStorage};

/// Allocation statistics of a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub chunks: usize,
    pub allocated_bytes: u64,
    pub limit_bytes: u64,
}

pub trait ChunkStorage: Send + Sync + 'static {
    type Region: ChunkRegion;

    /// Region reads and writes block the calling thread, so the chunk server
    /// runs them on tokio's blocking pool.
    const BLOCKING_IO: bool = false;

    /// Allocate a zeroed region of exactly `size` bytes.
    ///
    /// Fails with [`PfsError::OutOfCapacity`] when the budget is exhausted.
    fn allocate(&self, chunk_id: ChunkId, size: u64) -> Result<Self::Region>;

    /// Give a released chunk's bytes back to the budget. The region itself
    /// is dropped by its last holder.
    fn release(&self, chunk_id: ChunkId, capacity: u64) -> Result<()>;

    fn stats(&self) -> StorageStats;
}

pub trait ChunkRegion: Send + Sync + 'static {
    fn capacity(&self) -> u64;

    /// Copy out `n` bytes starting at `offset`. The range must lie inside the
    /// region.
    fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>>;

    /// Overwrite bytes starting at `offset`. The range must lie inside the
    /// region.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
}

/// Byte budget shared by the storage backends.
#[derive(Debug)]
pub(crate) struct Budget {
    limit: u64,
    allocated: AtomicU64,
    chunks: AtomicUsize,
}

impl Budget {
    pub(crate) fn new(limit: u64) -> Self {
        Budget {
            limit,
            allocated: AtomicU64::new(0),
            chunks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn reserve(&self, size: u64) -> Result<()> {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= self.limit)
            })
            .map_err(|used| {
                PfsError::OutOfCapacity(format!(
                    "cannot allocate {size} bytes: {used} of {} in use",
                    self.limit
                ))
            })?;
        self.chunks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn free(&self, size: u64) {
        self.allocated.fetch_sub(size, Ordering::AcqRel);
        self.chunks.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn stats(&self) -> StorageStats {
        StorageStats {
            chunks: self.chunks.load(Ordering::Acquire),
            allocated_bytes: self.allocated.load(Ordering::Acquire),
            limit_bytes: self.limit,
        }
    }
}

pub(crate) fn check_range(capacity: u64, offset: u64, len: usize) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(PfsError::OverflowsCapacity(format!(
            "range {offset}+{len} outside region of {capacity} bytes"
        ))),
    }
}
