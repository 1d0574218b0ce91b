use crate::common::ChunkId;
use crate::error::{PfsError, Result};
use crate::storage::{check_range, Budget, ChunkRegion, ChunkStorage, StorageStats};

/// Chunk buffers held as contiguous heap allocations.
#[derive(Debug)]
pub struct MemoryStorage {
    budget: Budget,
}

#[derive(Debug)]
pub struct MemoryRegion {
    buf: Vec<u8>,
}

impl MemoryStorage {
    pub fn new(limit_bytes: u64) -> Self {
        MemoryStorage {
            budget: Budget::new(limit_bytes),
        }
    }
}

impl ChunkStorage for MemoryStorage {
    type Region = MemoryRegion;

    fn allocate(&self, chunk_id: ChunkId, size: u64) -> Result<MemoryRegion> {
        let len = usize::try_from(size)
            .map_err(|_| PfsError::OutOfCapacity(format!("chunk {chunk_id}: {size} bytes")))?;
        self.budget.reserve(size)?;

        let mut buf = Vec::new();
        if let Err(e) = buf.try_reserve_exact(len) {
            self.budget.free(size);
            return Err(PfsError::OutOfCapacity(format!("chunk {chunk_id}: {e}")));
        }
        buf.resize(len, 0);
        Ok(MemoryRegion { buf })
    }

    fn release(&self, _chunk_id: ChunkId, capacity: u64) -> Result<()> {
        self.budget.free(capacity);
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        self.budget.stats()
    }
}

impl ChunkRegion for MemoryRegion {
    fn capacity(&self) -> u64 {
        self.buf.len() as u64
    }

    fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        check_range(self.capacity(), offset, n)?;
        let start = offset as usize;
        Ok(self.buf[start..start + n].to_vec())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(self.capacity(), offset, data.len())?;
        let start = offset as usize;
        self.buf[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_write_read() {
        let storage = MemoryStorage::new(1024);
        let mut region = storage.allocate(ChunkId::new(), 8).unwrap();
        assert_eq!(region.capacity(), 8);
        assert_eq!(region.read_at(0, 8).unwrap(), vec![0; 8]);

        region.write_at(2, b"abc").unwrap();
        assert_eq!(region.read_at(1, 5).unwrap(), b"\0abc\0");
        assert!(region.write_at(6, b"abc").is_err());
        assert!(region.read_at(7, 2).is_err());
    }

    #[test]
    fn release_returns_budget() {
        let storage = MemoryStorage::new(16);
        let id = ChunkId::new();
        let region = storage.allocate(id, 16).unwrap();
        assert!(matches!(
            storage.allocate(ChunkId::new(), 1),
            Err(PfsError::OutOfCapacity(_))
        ));
        storage.release(id, region.capacity()).unwrap();
        drop(region);
        assert_eq!(storage.stats().allocated_bytes, 0);
        storage.allocate(ChunkId::new(), 1).unwrap();
    }
}
