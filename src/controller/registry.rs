//! In-memory registry of chunk servers and blobs.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::common::{validate_address, BlobId, ChunkId};
use crate::controller::{BlobMetadata, BlobStatus, ChunkRef};
use crate::error::{PfsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Healthy,
    /// Declared for liveness detection, which is not implemented; nothing
    /// assigns it yet.
    Unreachable,
}

/// Operator view of a registered chunk server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkServerInfo {
    pub address: String,
    pub status: ServerStatus,
    pub resident_chunks: u64,
}

#[derive(Debug)]
struct ChunkserverEntry {
    status: ServerStatus,
    resident: HashSet<ChunkId>,
}

#[derive(Debug)]
struct ChunkRecord {
    chunk_ref: ChunkRef,
    committed: bool,
    reported: HashSet<String>,
}

#[derive(Debug)]
struct BlobRecord {
    status: BlobStatus,
    size_bytes: u64,
    chunks: Vec<ChunkRecord>,
}

#[derive(Debug, Default)]
pub struct Registry {
    chunkservers: HashMap<String, ChunkserverEntry>,
    blobs: HashMap<BlobId, BlobRecord>,
    /// Chunk -> (owning blob, index within the blob).
    chunk_index: HashMap<ChunkId, (BlobId, usize)>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Record a chunk server as Healthy. Re-registration keeps the resident
    /// set. Returns true for a server not seen before.
    pub fn add_chunk_server(&mut self, address: &str) -> Result<bool> {
        validate_address(address)?;
        match self.chunkservers.get_mut(address) {
            Some(entry) => {
                entry.status = ServerStatus::Healthy;
                Ok(false)
            }
            None => {
                self.chunkservers.insert(
                    address.to_string(),
                    ChunkserverEntry {
                        status: ServerStatus::Healthy,
                        resident: HashSet::new(),
                    },
                );
                Ok(true)
            }
        }
    }

    pub fn remove_chunk_server(&mut self, address: &str) -> Result<()> {
        self.chunkservers
            .remove(address)
            .map(|_| ())
            .ok_or_else(|| PfsError::NotFound(format!("chunk server {address}")))
    }

    /// Addresses of Healthy servers, sorted so callers shuffle from a stable
    /// starting point.
    pub fn healthy(&self) -> Vec<String> {
        let mut healthy: Vec<String> = self
            .chunkservers
            .iter()
            .filter(|(_, entry)| entry.status == ServerStatus::Healthy)
            .map(|(address, _)| address.clone())
            .collect();
        healthy.sort();
        healthy
    }

    pub fn chunk_servers(&self) -> Vec<ChunkServerInfo> {
        let mut servers: Vec<ChunkServerInfo> = self
            .chunkservers
            .iter()
            .map(|(address, entry)| ChunkServerInfo {
                address: address.clone(),
                status: entry.status,
                resident_chunks: entry.resident.len() as u64,
            })
            .collect();
        servers.sort_by(|a, b| a.address.cmp(&b.address));
        servers
    }

    pub fn resident(&self, address: &str) -> Option<&HashSet<ChunkId>> {
        self.chunkservers.get(address).map(|entry| &entry.resident)
    }

    /// Store a fully placed blob and note its chunks on their servers.
    pub fn insert_blob(&mut self, blob_id: BlobId, size_bytes: u64, chunks: Vec<ChunkRef>) {
        for (index, chunk_ref) in chunks.iter().enumerate() {
            self.chunk_index.insert(chunk_ref.chunk_id, (blob_id, index));
            for address in &chunk_ref.replicas {
                // A server removed mid-placement simply loses the record.
                if let Some(entry) = self.chunkservers.get_mut(address) {
                    entry.resident.insert(chunk_ref.chunk_id);
                }
            }
        }

        let status = if chunks.is_empty() {
            BlobStatus::Sealed
        } else {
            BlobStatus::New
        };
        let chunks = chunks
            .into_iter()
            .map(|chunk_ref| ChunkRecord {
                chunk_ref,
                committed: false,
                reported: HashSet::new(),
            })
            .collect();
        self.blobs.insert(
            blob_id,
            BlobRecord {
                status,
                size_bytes,
                chunks,
            },
        );
    }

    pub fn blob_metadata(&self, blob_id: BlobId) -> Result<BlobMetadata> {
        let blob = self
            .blobs
            .get(&blob_id)
            .ok_or_else(|| PfsError::NotFound(format!("blob {blob_id}")))?;
        Ok(BlobMetadata {
            blob_id,
            status: blob.status,
            size_bytes: blob.size_bytes,
            chunks: blob.chunks.iter().map(|c| c.chunk_ref.clone()).collect(),
        })
    }

    /// Chunks of a New blob whose primary has not reported Committed, in
    /// blob order. Empty once the blob is Sealed.
    pub fn uncommitted(&self, blob_id: BlobId) -> Result<Vec<ChunkRef>> {
        let blob = self
            .blobs
            .get(&blob_id)
            .ok_or_else(|| PfsError::NotFound(format!("blob {blob_id}")))?;
        Ok(blob
            .chunks
            .iter()
            .filter(|c| !c.committed)
            .map(|c| c.chunk_ref.clone())
            .collect())
    }

    /// Record that `address` holds a Committed copy of `chunk_id`.
    ///
    /// A chunk counts as Committed once its primary reports, since the
    /// primary only completes a write after every secondary applied it.
    /// Returns the blob id when this report sealed the blob.
    pub fn report_committed(&mut self, chunk_id: ChunkId, address: &str) -> Result<Option<BlobId>> {
        let (blob_id, index) = *self
            .chunk_index
            .get(&chunk_id)
            .ok_or_else(|| PfsError::NotFound(format!("chunk {chunk_id}")))?;
        let blob = self
            .blobs
            .get_mut(&blob_id)
            .ok_or_else(|| PfsError::NotFound(format!("blob {blob_id}")))?;

        let record = &mut blob.chunks[index];
        if !record.chunk_ref.replicas.iter().any(|r| r == address) {
            return Err(PfsError::InvalidArgument(format!(
                "{address} is not a replica of chunk {chunk_id}"
            )));
        }
        record.reported.insert(address.to_string());
        if record.chunk_ref.primary() == Some(address) {
            record.committed = true;
        }

        if blob.status == BlobStatus::New && blob.chunks.iter().all(|c| c.committed) {
            blob.status = BlobStatus::Sealed;
            return Ok(Some(blob_id));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(replicas: &[&str]) -> ChunkRef {
        ChunkRef {
            chunk_id: ChunkId::new(),
            replicas: replicas.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn reregistration_keeps_resident_set() {
        let mut registry = Registry::new();
        assert!(registry.add_chunk_server("a:1").unwrap());
        let c = chunk(&["a:1"]);
        registry.insert_blob(BlobId::new(), 4, vec![c.clone()]);
        assert!(!registry.add_chunk_server("a:1").unwrap());
        assert!(registry.resident("a:1").unwrap().contains(&c.chunk_id));
        assert_eq!(registry.chunk_servers()[0].resident_chunks, 1);
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.add_chunk_server("nope"),
            Err(PfsError::MalformedAddress(_))
        ));
        assert!(registry.healthy().is_empty());
    }

    #[test]
    fn removal() {
        let mut registry = Registry::new();
        registry.add_chunk_server("b:1").unwrap();
        registry.add_chunk_server("a:1").unwrap();
        assert_eq!(registry.healthy(), vec!["a:1".to_string(), "b:1".to_string()]);
        registry.remove_chunk_server("a:1").unwrap();
        assert_eq!(registry.healthy(), vec!["b:1".to_string()]);
        assert!(matches!(
            registry.remove_chunk_server("a:1"),
            Err(PfsError::NotFound(_))
        ));
    }

    #[test]
    fn blob_seals_when_every_primary_reports() {
        let mut registry = Registry::new();
        let blob_id = BlobId::new();
        let first = chunk(&["a:1", "b:1"]);
        let second = chunk(&["b:1", "a:1"]);
        registry.insert_blob(blob_id, 6, vec![first.clone(), second.clone()]);

        // Secondary reports do not commit the chunk.
        assert_eq!(registry.report_committed(first.chunk_id, "b:1").unwrap(), None);
        assert_eq!(registry.report_committed(first.chunk_id, "a:1").unwrap(), None);
        assert_eq!(registry.blob_metadata(blob_id).unwrap().status, BlobStatus::New);

        assert_eq!(
            registry.report_committed(second.chunk_id, "b:1").unwrap(),
            Some(blob_id)
        );
        assert_eq!(registry.blob_metadata(blob_id).unwrap().status, BlobStatus::Sealed);
        // Late reports are harmless.
        assert_eq!(registry.report_committed(second.chunk_id, "a:1").unwrap(), None);
    }

    #[test]
    fn uncommitted_chunks_shrink_as_primaries_report() {
        let mut registry = Registry::new();
        let blob_id = BlobId::new();
        let first = chunk(&["a:1", "b:1"]);
        let second = chunk(&["b:1"]);
        registry.insert_blob(blob_id, 6, vec![first.clone(), second.clone()]);
        assert_eq!(registry.uncommitted(blob_id).unwrap(), vec![first.clone(), second.clone()]);

        registry.report_committed(first.chunk_id, "b:1").unwrap();
        assert_eq!(registry.uncommitted(blob_id).unwrap().len(), 2);
        registry.report_committed(first.chunk_id, "a:1").unwrap();
        assert_eq!(registry.uncommitted(blob_id).unwrap(), vec![second.clone()]);
        registry.report_committed(second.chunk_id, "b:1").unwrap();
        assert!(registry.uncommitted(blob_id).unwrap().is_empty());
        assert!(matches!(
            registry.uncommitted(BlobId::new()),
            Err(PfsError::NotFound(_))
        ));
    }

    #[test]
    fn reports_are_checked() {
        let mut registry = Registry::new();
        let c = chunk(&["a:1"]);
        registry.insert_blob(BlobId::new(), 4, vec![c.clone()]);
        assert!(matches!(
            registry.report_committed(c.chunk_id, "z:1"),
            Err(PfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.report_committed(ChunkId::new(), "a:1"),
            Err(PfsError::NotFound(_))
        ));
    }

    #[test]
    fn empty_blob_is_sealed() {
        let mut registry = Registry::new();
        let blob_id = BlobId::new();
        registry.insert_blob(blob_id, 0, Vec::new());
        let meta = registry.blob_metadata(blob_id).unwrap();
        assert_eq!(meta.status, BlobStatus::Sealed);
        assert!(meta.chunks.is_empty());
        assert!(matches!(
            registry.blob_metadata(BlobId::new()),
            Err(PfsError::NotFound(_))
        ));
    }
}
