//! State of a single chunk replica on a chunk server.
//!
//! A [`Chunk`] owns its storage region and an append cursor
//! (`committed_bytes`). All ordering rules for writes live here; locking and
//! replication are the chunk server's job.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::common::ChunkId;
use crate::error::{PfsError, Result};
use crate::storage::ChunkRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    /// Placed and accepting writes.
    Assigned,
    /// Every byte written; read-only.
    Committed,
    /// A secondary failed to apply a write the primary already applied.
    /// Read-only; recovery is an operator concern.
    ReplicaDiverged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Primary,
    Secondary,
}

/// Snapshot returned by GetChunkStatus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub status: ChunkStatus,
    pub role: ReplicaRole,
    pub capacity: u64,
    pub committed_bytes: u64,
    /// CRC-32 of `buffer[0..committed_bytes]`.
    pub checksum: u32,
}

pub struct Chunk<R> {
    pub id: ChunkId,
    region: R,
    committed_bytes: u64,
    status: ChunkStatus,
    role: ReplicaRole,
    primary_address: Option<String>,
    /// Secondaries in replica order; only populated on the primary.
    secondaries: Vec<String>,
    /// Running CRC-32 of the committed prefix.
    checksum: Hasher,
}

impl<R: ChunkRegion> Chunk<R> {
    pub fn new(id: ChunkId, region: R, role: ReplicaRole, primary_address: Option<String>) -> Self {
        Chunk {
            id,
            region,
            committed_bytes: 0,
            status: ChunkStatus::Assigned,
            role,
            primary_address,
            secondaries: Vec::new(),
            checksum: Hasher::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.region.capacity()
    }

    pub fn committed_bytes(&self) -> u64 {
        self.committed_bytes
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    pub fn primary_address(&self) -> Option<&str> {
        self.primary_address.as_deref()
    }

    pub fn secondaries(&self) -> &[String] {
        &self.secondaries
    }

    /// Fix the secondaries a primary forwards writes to.
    ///
    /// The list may be replaced freely until the first byte is written;
    /// after that only the same list is accepted.
    pub fn set_secondaries(&mut self, secondaries: Vec<String>) -> Result<()> {
        if self.role != ReplicaRole::Primary {
            return Err(PfsError::InvalidArgument(format!(
                "chunk {} is not a primary replica here",
                self.id
            )));
        }
        if self.committed_bytes > 0 && self.secondaries != secondaries {
            return Err(PfsError::InvalidArgument(format!(
                "chunk {} already holds {} bytes replicated to {:?}",
                self.id, self.committed_bytes, self.secondaries
            )));
        }
        self.secondaries = secondaries;
        Ok(())
    }

    /// Apply `data` at `offset` to the local buffer and return the number of
    /// bytes the write covers.
    ///
    /// The write must start at or before the cursor. Bytes that overlap the
    /// committed prefix must equal what is already there (a replayed write);
    /// anything past the cursor is appended. Rejected writes leave the chunk
    /// untouched.
    pub fn apply_write(&mut self, offset: u64, data: &[u8]) -> Result<u64> {
        if self.status == ChunkStatus::ReplicaDiverged {
            return Err(PfsError::ReplicationFailed(format!(
                "chunk {} diverged from its replicas and is read-only",
                self.id
            )));
        }

        let capacity = self.capacity();
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= capacity)
            .ok_or_else(|| {
                PfsError::OverflowsCapacity(format!(
                    "chunk {}: write of {} bytes at {offset} exceeds capacity {capacity}",
                    self.id,
                    data.len()
                ))
            })?;

        if offset > self.committed_bytes {
            return Err(PfsError::WriteOutOfOrder(format!(
                "chunk {}: write at {offset} leaves a gap after cursor {}",
                self.id, self.committed_bytes
            )));
        }

        let overlap = (self.committed_bytes.min(end) - offset) as usize;
        if overlap > 0 {
            let existing = self.region.read_at(offset, overlap)?;
            if existing != data[..overlap] {
                return Err(PfsError::WriteOutOfOrder(format!(
                    "chunk {}: write at {offset} rewrites committed bytes (cursor {})",
                    self.id, self.committed_bytes
                )));
            }
        }

        let tail = &data[overlap..];
        if !tail.is_empty() {
            self.region.write_at(self.committed_bytes, tail)?;
            self.checksum.update(tail);
            self.committed_bytes = end;
        }
        assert!(
            self.committed_bytes <= capacity,
            "chunk {} cursor {} beyond capacity {capacity}",
            self.id,
            self.committed_bytes
        );

        Ok(data.len() as u64)
    }

    /// Move a full chunk to Committed. Returns true on the transition.
    pub fn seal_if_full(&mut self) -> bool {
        if self.status == ChunkStatus::Assigned && self.committed_bytes == self.capacity() {
            self.status = ChunkStatus::Committed;
            return true;
        }
        false
    }

    pub fn mark_diverged(&mut self) {
        self.status = ChunkStatus::ReplicaDiverged;
    }

    /// Read up to `num_bytes` committed bytes from `offset`; zero means
    /// "through the cursor".
    pub fn read(&self, offset: u64, num_bytes: u64) -> Result<Vec<u8>> {
        if offset >= self.committed_bytes {
            return Ok(Vec::new());
        }
        let available = self.committed_bytes - offset;
        let n = if num_bytes == 0 {
            available
        } else {
            num_bytes.min(available)
        };
        self.region.read_at(offset, n as usize)
    }

    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            status: self.status,
            role: self.role,
            capacity: self.capacity(),
            committed_bytes: self.committed_bytes,
            checksum: self.checksum.clone().finalize(),
        }
    }
}
