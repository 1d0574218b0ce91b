use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::common::ChunkId;
use crate::error::Result;
use crate::storage::{check_range, Budget, ChunkRegion, ChunkStorage, StorageStats};

/// Chunk buffers held as fixed-length files, one per chunk, in a storage
/// directory.
#[derive(Debug)]
pub struct FileStorage {
    // The path to the chunkserver storage directory.
    storage_dir: PathBuf,
    budget: Budget,
}

#[derive(Debug)]
pub struct FileRegion {
    file: File,
    capacity: u64,
}

impl FileStorage {
    pub fn new(storage_dir: impl Into<PathBuf>, limit_bytes: u64) -> Result<FileStorage> {
        let storage_dir = storage_dir.into();

        // If directory does not exist, create it.
        if !storage_dir.exists() {
            std::fs::create_dir_all(&storage_dir)?;
        }

        Ok(FileStorage {
            storage_dir,
            budget: Budget::new(limit_bytes),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn chunk_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.storage_dir.join(format!("ch{chunk_id}"))
    }
}

/// Region I/O goes through the blocking pool. Allocation and release stay
/// on the caller's thread: they run once per chunk and only create, size or
/// unlink a file.
impl ChunkStorage for FileStorage {
    type Region = FileRegion;

    const BLOCKING_IO: bool = true;

    fn allocate(&self, chunk_id: ChunkId, size: u64) -> Result<FileRegion> {
        self.budget.reserve(size)?;

        let path = self.chunk_path(chunk_id);
        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .and_then(|file| file.set_len(size).map(|_| file));

        match opened {
            Ok(file) => Ok(FileRegion {
                file,
                capacity: size,
            }),
            Err(e) => {
                self.budget.free(size);
                let _ = std::fs::remove_file(&path);
                Err(e.into())
            }
        }
    }

    fn release(&self, chunk_id: ChunkId, capacity: u64) -> Result<()> {
        self.budget.free(capacity);
        std::fs::remove_file(self.chunk_path(chunk_id))?;
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        self.budget.stats()
    }
}

impl ChunkRegion for FileRegion {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        check_range(self.capacity, offset, n)?;
        let mut buf = vec![0; n];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(self.capacity, offset, data.len())?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }
}
