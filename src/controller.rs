//! The controller: registry of chunk servers, blob allocation and replica
//! placement.
//!
//! The registry sits behind a single read/write lock. It is never held
//! across a network call: placement runs against a snapshot of the Healthy
//! set and the finished blob is inserted afterwards.

pub mod placement;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunk::ChunkStatus;
use crate::common::{BlobId, ChunkId};
use crate::config::Config;
use crate::error::{PfsError, Result};
use crate::network::{ControllerService, Network};

use self::placement::{abandon, place_chunk};
use self::registry::{ChunkServerInfo, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobStatus {
    New,
    /// Every chunk is Committed; the blob is read-only.
    Sealed,
}

/// Where one chunk of a blob lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: ChunkId,
    /// Replica addresses in replication order; the first is the primary.
    pub replicas: Vec<String>,
}

impl ChunkRef {
    pub fn primary(&self) -> Option<&str> {
        self.replicas.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub blob_id: BlobId,
    pub status: BlobStatus,
    pub size_bytes: u64,
    pub chunks: Vec<ChunkRef>,
}

/// Chunk capacities for a blob of `size_bytes`: full chunks of `capacity`
/// followed by one partial chunk for any remainder.
pub fn chunk_layout(size_bytes: u64, capacity: u64) -> Result<Vec<u64>> {
    if capacity == 0 {
        return Err(PfsError::Config("chunk_capacity must be at least 1 byte".into()));
    }
    let mut sizes = Vec::with_capacity(size_bytes.div_ceil(capacity) as usize);
    let mut remaining = size_bytes;
    while remaining > 0 {
        let size = remaining.min(capacity);
        sizes.push(size);
        remaining -= size;
    }
    Ok(sizes)
}

pub struct Controller {
    chunk_capacity: u64,
    default_replication_factor: u32,
    registry: RwLock<Registry>,
    network: Arc<dyn Network>,
    rng: Mutex<StdRng>,
}

impl Controller {
    pub fn new(config: &Config, network: Arc<dyn Network>) -> Controller {
        Controller::with_rng(config, network, StdRng::from_entropy())
    }

    /// A controller whose placement decisions are reproducible.
    pub fn with_seed(config: &Config, network: Arc<dyn Network>, seed: u64) -> Controller {
        Controller::with_rng(config, network, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &Config, network: Arc<dyn Network>, rng: StdRng) -> Controller {
        Controller {
            chunk_capacity: config.chunk_capacity,
            default_replication_factor: config.default_replication_factor,
            registry: RwLock::new(Registry::new()),
            network,
            rng: Mutex::new(rng),
        }
    }

    pub fn chunk_capacity(&self) -> u64 {
        self.chunk_capacity
    }

    fn record_commit(&self, chunk_id: ChunkId, address: &str) -> Result<()> {
        let sealed = self.registry.write().report_committed(chunk_id, address)?;
        if let Some(blob_id) = sealed {
            info!(%blob_id, "blob sealed");
        }
        Ok(())
    }

    /// Ask the primaries of `pending` chunks whether they are Committed and
    /// record those that are. Stops at the first chunk still open, since
    /// the blob cannot seal past it.
    async fn reconcile(&self, blob_id: BlobId, pending: &[ChunkRef]) {
        for chunk in pending {
            let Some(primary) = chunk.primary() else {
                continue;
            };
            let status = match self.network.chunk_server(primary) {
                Ok(service) => service.get_chunk_status(chunk.chunk_id).await,
                Err(e) => Err(e),
            };
            match status {
                Ok(info) if info.status == ChunkStatus::Committed => {
                    debug!(%blob_id, chunk_id = %chunk.chunk_id, %primary, "recovered commit");
                    if let Err(e) = self.record_commit(chunk.chunk_id, primary) {
                        warn!(%blob_id, chunk_id = %chunk.chunk_id, error = %e, "could not record commit");
                        return;
                    }
                }
                Ok(_) => return,
                Err(e) => {
                    debug!(%blob_id, chunk_id = %chunk.chunk_id, %primary, error = %e, "primary status unknown");
                    return;
                }
            }
        }
    }

    /// A random permutation of the Healthy servers.
    fn shuffled(&self, healthy: &[String]) -> Vec<String> {
        let mut candidates = healthy.to_vec();
        candidates.shuffle(&mut *self.rng.lock());
        candidates
    }
}

#[async_trait]
impl ControllerService for Controller {
    async fn add_chunk_server(&self, address: String) -> Result<()> {
        let added = self.registry.write().add_chunk_server(&address)?;
        if added {
            info!(%address, "chunk server registered");
        } else {
            info!(%address, "chunk server re-registered");
        }
        Ok(())
    }

    async fn create_blob(&self, size_bytes: u64, num_replicas: u32) -> Result<BlobMetadata> {
        let layout = chunk_layout(size_bytes, self.chunk_capacity)?;
        let replicas = match num_replicas {
            0 => self.default_replication_factor,
            n => n,
        } as usize;
        let healthy = self.registry.read().healthy();
        if replicas > healthy.len() {
            return Err(PfsError::InsufficientCapacity(format!(
                "{replicas} replicas requested, {} chunk servers healthy",
                healthy.len()
            )));
        }

        let blob_id = BlobId::new();
        let mut chunks: Vec<ChunkRef> = Vec::new();
        for size in layout {
            let chunk_id = ChunkId::new();
            let candidates = self.shuffled(&healthy);
            match place_chunk(self.network.as_ref(), &candidates, chunk_id, size, replicas).await {
                Ok(placed) => chunks.push(ChunkRef {
                    chunk_id,
                    replicas: placed,
                }),
                Err(e) => {
                    warn!(%blob_id, chunk_index = chunks.len(), error = %e, "placement failed");
                    for chunk in &chunks {
                        abandon(self.network.as_ref(), chunk.chunk_id, &chunk.replicas).await;
                    }
                    return Err(e);
                }
            }
        }

        info!(%blob_id, size_bytes, chunks = chunks.len(), replicas, "blob created");
        let mut registry = self.registry.write();
        registry.insert_blob(blob_id, size_bytes, chunks);
        registry.blob_metadata(blob_id)
    }

    /// A New blob's open chunks are checked with their primaries first, so
    /// a lost commit report cannot keep the blob from sealing.
    async fn get_blob_metadata(&self, blob_id: BlobId) -> Result<BlobMetadata> {
        let pending = self.registry.read().uncommitted(blob_id)?;
        if !pending.is_empty() {
            self.reconcile(blob_id, &pending).await;
        }
        self.registry.read().blob_metadata(blob_id)
    }

    async fn report_chunk_committed(&self, chunk_id: ChunkId, address: String) -> Result<()> {
        debug!(%chunk_id, %address, "chunk committed");
        self.record_commit(chunk_id, &address)
    }

    async fn list_chunk_servers(&self) -> Result<Vec<ChunkServerInfo>> {
        Ok(self.registry.read().chunk_servers())
    }

    async fn remove_chunk_server(&self, address: String) -> Result<()> {
        self.registry.write().remove_chunk_server(&address)?;
        info!(%address, "chunk server removed");
        Ok(())
    }
}
