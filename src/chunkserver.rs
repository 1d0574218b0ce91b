//! The chunk server: holds chunk buffers and drives primary-copy
//! replication.
//!
//! Writes to one chunk are serialised by a per-chunk writer lock held for the
//! whole apply-then-forward pipeline. The chunk state itself sits behind a
//! read/write lock that writers take only while applying bytes, so reads are
//! never blocked on replication and never observe a half-applied write.
//!
//! A primary forwards to the secondaries the controller hands it with
//! SetReplicas; secondaries never announce themselves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::chunk::{Chunk, ChunkInfo, ReplicaRole};
use crate::common::{validate_address, ChunkId};
use crate::error::{PfsError, Result};
use crate::network::{ChunkService, Network};
use crate::storage::{ChunkStorage, StorageStats};

struct ChunkSlot<R> {
    writer: tokio::sync::Mutex<()>,
    state: RwLock<Chunk<R>>,
}

pub struct Chunkserver<S: ChunkStorage> {
    /// Address this server is reachable at; sent to primaries and the
    /// controller.
    pub id: String,
    controller: Option<String>,
    network: Arc<dyn Network>,

    /// The storage for the chunkserver.
    storage: S,

    chunks: RwLock<HashMap<ChunkId, Arc<ChunkSlot<S::Region>>>>,
}

impl<S: ChunkStorage> Chunkserver<S> {
    /// Create a chunk server. With a controller address, chunks reaching
    /// Committed are reported to it.
    pub fn new(
        id: String,
        controller: Option<String>,
        network: Arc<dyn Network>,
        storage: S,
    ) -> Chunkserver<S> {
        Chunkserver {
            id,
            controller,
            network,
            storage,
            chunks: RwLock::new(HashMap::new()),
        }
    }

    /// Register this server with the controller.
    pub async fn register(&self) -> Result<()> {
        let controller = self.controller.as_deref().ok_or_else(|| {
            PfsError::Config("chunk server has no controller address".into())
        })?;
        self.network
            .controller(controller)?
            .add_chunk_server(self.id.clone())
            .await?;
        info!(address = %self.id, %controller, "registered with controller");
        Ok(())
    }

    pub fn storage_stats(&self) -> StorageStats {
        self.storage.stats()
    }

    fn slot(&self, chunk_id: ChunkId) -> Result<Arc<ChunkSlot<S::Region>>> {
        self.chunks
            .read()
            .get(&chunk_id)
            .cloned()
            .ok_or_else(|| PfsError::NotFound(format!("chunk {chunk_id} on {}", self.id)))
    }

    fn remove_slot(&self, chunk_id: ChunkId) -> Result<()> {
        let removed = self.chunks.write().remove(&chunk_id);
        match removed {
            Some(slot) => {
                let capacity = slot.state.read().capacity();
                self.storage.release(chunk_id, capacity)
            }
            None => Err(PfsError::NotFound(format!("chunk {chunk_id} on {}", self.id))),
        }
    }

    /// Run `f` against a chunk, on the blocking pool when the storage
    /// backend does blocking I/O.
    async fn with_chunk<T, F>(slot: &Arc<ChunkSlot<S::Region>>, f: F) -> Result<T>
    where
        F: FnOnce(&ChunkSlot<S::Region>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if !S::BLOCKING_IO {
            return f(slot.as_ref());
        }
        let slot = slot.clone();
        tokio::task::spawn_blocking(move || f(slot.as_ref()))
            .await
            .map_err(|e| PfsError::Io(std::io::Error::other(e)))?
    }

    /// Best effort: a lost report is picked up by the controller when it
    /// next reads the blob's metadata.
    async fn report_committed(&self, chunk_id: ChunkId) {
        let Some(controller) = self.controller.as_deref() else {
            return;
        };
        let reported = match self.network.controller(controller) {
            Ok(service) => service.report_chunk_committed(chunk_id, self.id.clone()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = reported {
            warn!(%chunk_id, %controller, error = %e, "failed to report committed chunk");
        }
    }

    /// Forward a write the primary already applied to each secondary in
    /// replica order. Stops at the first failure.
    async fn replicate(
        &self,
        chunk_id: ChunkId,
        secondaries: &[String],
        offset: u64,
        data: &[u8],
        bytes_written: u64,
    ) -> Result<()> {
        for secondary in secondaries {
            let acked = match self.network.chunk_server(secondary) {
                Ok(service) => service.write_chunk(chunk_id, offset, data.to_vec()).await,
                Err(e) => Err(e),
            };
            match acked {
                Ok(n) if n == bytes_written => {
                    debug!(%chunk_id, %secondary, offset, n, "secondary acknowledged");
                }
                Ok(n) => {
                    return Err(PfsError::ReplicationFailed(format!(
                        "chunk {chunk_id}: {secondary} acknowledged {n} bytes, expected {bytes_written}"
                    )));
                }
                Err(e) => {
                    return Err(PfsError::ReplicationFailed(format!(
                        "chunk {chunk_id}: {secondary}: {e}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ChunkStorage> ChunkService for Chunkserver<S> {
    async fn create_chunk(
        &self,
        chunk_id: ChunkId,
        size: u64,
        role: ReplicaRole,
        primary_address: Option<String>,
    ) -> Result<()> {
        match (role, &primary_address) {
            (ReplicaRole::Primary, Some(_)) => {
                return Err(PfsError::InvalidArgument(
                    "a primary replica has no upstream address".into(),
                ));
            }
            (ReplicaRole::Secondary, None) => {
                return Err(PfsError::InvalidArgument(
                    "a secondary replica needs its primary's address".into(),
                ));
            }
            (ReplicaRole::Secondary, Some(primary)) => validate_address(primary)?,
            (ReplicaRole::Primary, None) => {}
        }
        if self.chunks.read().contains_key(&chunk_id) {
            return Err(PfsError::AlreadyExists(format!("chunk {chunk_id} on {}", self.id)));
        }

        let region = self.storage.allocate(chunk_id, size)?;
        let slot = Arc::new(ChunkSlot {
            writer: tokio::sync::Mutex::new(()),
            state: RwLock::new(Chunk::new(chunk_id, region, role, primary_address.clone())),
        });
        {
            let mut chunks = self.chunks.write();
            if chunks.contains_key(&chunk_id) {
                drop(chunks);
                self.storage.release(chunk_id, size)?;
                return Err(PfsError::AlreadyExists(format!("chunk {chunk_id} on {}", self.id)));
            }
            chunks.insert(chunk_id, slot);
        }

        info!(%chunk_id, size, ?role, primary = ?primary_address, "created chunk");
        Ok(())
    }

    async fn set_replicas(&self, chunk_id: ChunkId, secondaries: Vec<String>) -> Result<()> {
        for address in &secondaries {
            validate_address(address)?;
        }
        let slot = self.slot(chunk_id)?;
        let _writer = slot.writer.lock().await;
        slot.state.write().set_secondaries(secondaries.clone())?;
        debug!(%chunk_id, ?secondaries, "replica list set");
        Ok(())
    }

    async fn write_chunk(&self, chunk_id: ChunkId, offset: u64, data: Vec<u8>) -> Result<u64> {
        let slot = self.slot(chunk_id)?;
        let _writer = slot.writer.lock().await;

        let (bytes_written, role, secondaries, data) = Self::with_chunk(&slot, move |slot| {
            let mut chunk = slot.state.write();
            let n = chunk.apply_write(offset, &data)?;
            Ok((n, chunk.role(), chunk.secondaries().to_vec(), data))
        })
        .await?;
        trace!(%chunk_id, offset, bytes_written, "applied write");

        if role == ReplicaRole::Primary {
            if let Err(e) = self
                .replicate(chunk_id, &secondaries, offset, &data, bytes_written)
                .await
            {
                slot.state.write().mark_diverged();
                warn!(%chunk_id, error = %e, "replication failed; chunk is now read-only");
                return Err(e);
            }
        }

        let sealed = slot.state.write().seal_if_full();
        if sealed {
            info!(%chunk_id, ?role, "chunk committed");
            self.report_committed(chunk_id).await;
        }
        Ok(bytes_written)
    }

    async fn read_chunk(&self, chunk_id: ChunkId, offset: u64, num_bytes: u64) -> Result<Vec<u8>> {
        let slot = self.slot(chunk_id)?;
        Self::with_chunk(&slot, move |slot| slot.state.read().read(offset, num_bytes)).await
    }

    async fn get_chunk_status(&self, chunk_id: ChunkId) -> Result<ChunkInfo> {
        let slot = self.slot(chunk_id)?;
        let info = slot.state.read().info();
        Ok(info)
    }

    async fn delete_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        self.remove_slot(chunk_id)?;
        info!(%chunk_id, "deleted chunk");
        Ok(())
    }

    async fn list_chunks(&self) -> Result<Vec<ChunkId>> {
        let mut ids: Vec<ChunkId> = self.chunks.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkStatus;
    use crate::network::NetworkShim;
    use crate::storage::{FileStorage, MemoryStorage};

    fn server(network: &Arc<NetworkShim>, address: &str) -> Arc<dyn ChunkService> {
        let cs: Arc<dyn ChunkService> = Arc::new(Chunkserver::new(
            address.to_string(),
            None,
            network.clone(),
            MemoryStorage::new(1 << 20),
        ));
        network.add_node(address, &cs);
        cs
    }

    #[tokio::test]
    async fn store_and_read_chunk() {
        let network = Arc::new(NetworkShim::new());
        let s = server(&network, "a:1");
        let id = ChunkId::new();
        s.create_chunk(id, 11, ReplicaRole::Primary, None).await.unwrap();
        assert_eq!(s.write_chunk(id, 0, b"hello world".to_vec()).await.unwrap(), 11);

        assert_eq!(s.read_chunk(id, 0, 100).await.unwrap(), b"hello world");
        assert_eq!(s.read_chunk(id, 0, 2).await.unwrap(), b"he");
        assert_eq!(s.read_chunk(id, 2, 2).await.unwrap(), b"ll");
        assert_eq!(s.read_chunk(id, 4, 100).await.unwrap(), b"o world");
        assert_eq!(s.read_chunk(id, 4, 0).await.unwrap(), b"o world");
        assert!(s.read_chunk(id, 11, 5).await.unwrap().is_empty());

        let info = s.get_chunk_status(id).await.unwrap();
        assert_eq!(info.status, ChunkStatus::Committed);
        assert_eq!(info.committed_bytes, 11);
        assert_eq!(info.capacity, 11);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_chunks() {
        let network = Arc::new(NetworkShim::new());
        let s = server(&network, "a:1");
        let id = ChunkId::new();
        s.create_chunk(id, 4, ReplicaRole::Primary, None).await.unwrap();
        assert!(matches!(
            s.create_chunk(id, 4, ReplicaRole::Primary, None).await,
            Err(PfsError::AlreadyExists(_))
        ));

        let other = ChunkId::new();
        assert!(matches!(
            s.read_chunk(other, 0, 1).await,
            Err(PfsError::NotFound(_))
        ));
        assert!(matches!(
            s.write_chunk(other, 0, b"x".to_vec()).await,
            Err(PfsError::NotFound(_))
        ));
        assert!(matches!(
            s.get_chunk_status(other).await,
            Err(PfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn out_of_capacity() {
        let network = Arc::new(NetworkShim::new());
        let cs: Arc<dyn ChunkService> = Arc::new(Chunkserver::new(
            "a:1".into(),
            None,
            network.clone(),
            MemoryStorage::new(6),
        ));
        cs.create_chunk(ChunkId::new(), 4, ReplicaRole::Primary, None)
            .await
            .unwrap();
        assert!(matches!(
            cs.create_chunk(ChunkId::new(), 4, ReplicaRole::Primary, None).await,
            Err(PfsError::OutOfCapacity(_))
        ));
    }

    #[tokio::test]
    async fn secondaries_receive_writes_in_order() {
        let network = Arc::new(NetworkShim::new());
        let a = server(&network, "a:1");
        let b = server(&network, "b:1");
        let c = server(&network, "c:1");
        let id = ChunkId::new();

        a.create_chunk(id, 6, ReplicaRole::Primary, None).await.unwrap();
        b.create_chunk(id, 6, ReplicaRole::Secondary, Some("a:1".into()))
            .await
            .unwrap();
        c.create_chunk(id, 6, ReplicaRole::Secondary, Some("a:1".into()))
            .await
            .unwrap();
        a.set_replicas(id, vec!["b:1".into(), "c:1".into()])
            .await
            .unwrap();

        a.write_chunk(id, 0, b"abc".to_vec()).await.unwrap();
        a.write_chunk(id, 3, b"def".to_vec()).await.unwrap();

        for replica in [&a, &b, &c] {
            assert_eq!(replica.read_chunk(id, 0, 0).await.unwrap(), b"abcdef");
            let info = replica.get_chunk_status(id).await.unwrap();
            assert_eq!(info.status, ChunkStatus::Committed);
            assert_eq!(info.checksum, crc32fast::hash(b"abcdef"));
        }
        assert_eq!(b.get_chunk_status(id).await.unwrap().role, ReplicaRole::Secondary);
    }

    #[tokio::test]
    async fn secondary_needs_a_primary_address() {
        let network = Arc::new(NetworkShim::new());
        let b = server(&network, "b:1");
        let id = ChunkId::new();
        assert!(matches!(
            b.create_chunk(id, 4, ReplicaRole::Secondary, None).await,
            Err(PfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            b.create_chunk(id, 4, ReplicaRole::Secondary, Some("no-port".into()))
                .await,
            Err(PfsError::MalformedAddress(_))
        ));
        assert!(b.list_chunks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_primaries_take_a_replica_list() {
        let network = Arc::new(NetworkShim::new());
        let a = server(&network, "a:1");
        let b = server(&network, "b:1");
        let id = ChunkId::new();
        a.create_chunk(id, 4, ReplicaRole::Primary, None).await.unwrap();
        b.create_chunk(id, 4, ReplicaRole::Secondary, Some("a:1".into()))
            .await
            .unwrap();

        assert!(matches!(
            b.set_replicas(id, vec!["c:1".into()]).await,
            Err(PfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            a.set_replicas(ChunkId::new(), vec!["b:1".into()]).await,
            Err(PfsError::NotFound(_))
        ));
        assert!(matches!(
            a.set_replicas(id, vec!["b".into()]).await,
            Err(PfsError::MalformedAddress(_))
        ));
    }

    #[tokio::test]
    async fn replication_failure_diverges_primary() {
        let network = Arc::new(NetworkShim::new());
        let a = server(&network, "a:1");
        let b = server(&network, "b:1");
        let id = ChunkId::new();
        a.create_chunk(id, 4, ReplicaRole::Primary, None).await.unwrap();
        b.create_chunk(id, 4, ReplicaRole::Secondary, Some("a:1".into()))
            .await
            .unwrap();
        a.set_replicas(id, vec!["b:1".into()]).await.unwrap();

        network.disconnect("b:1");
        assert!(matches!(
            a.write_chunk(id, 0, b"ab".to_vec()).await,
            Err(PfsError::ReplicationFailed(_))
        ));

        // The primary keeps its bytes but takes no more writes.
        assert_eq!(a.read_chunk(id, 0, 0).await.unwrap(), b"ab");
        assert_eq!(
            a.get_chunk_status(id).await.unwrap().status,
            ChunkStatus::ReplicaDiverged
        );
        assert!(matches!(
            a.write_chunk(id, 2, b"cd".to_vec()).await,
            Err(PfsError::ReplicationFailed(_))
        ));
        assert!(b.read_chunk(id, 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_releases_storage() {
        let network = Arc::new(NetworkShim::new());
        let cs = Arc::new(Chunkserver::new(
            "a:1".into(),
            None,
            network.clone() as Arc<dyn Network>,
            MemoryStorage::new(1024),
        ));
        let id = ChunkId::new();
        cs.create_chunk(id, 100, ReplicaRole::Primary, None).await.unwrap();
        assert_eq!(cs.storage_stats().allocated_bytes, 100);
        assert_eq!(cs.list_chunks().await.unwrap(), vec![id]);

        cs.delete_chunk(id).await.unwrap();
        assert_eq!(cs.storage_stats().allocated_bytes, 0);
        assert!(matches!(cs.delete_chunk(id).await, Err(PfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn concurrent_writers_serialise() {
        let network = Arc::new(NetworkShim::new());
        let s = server(&network, "a:1");
        let id = ChunkId::new();
        s.create_chunk(id, 8, ReplicaRole::Primary, None).await.unwrap();

        // Two identical appends race; exactly one applies, the other replays.
        let (x, y) = tokio::join!(
            s.write_chunk(id, 0, b"abcd".to_vec()),
            s.write_chunk(id, 0, b"abcd".to_vec())
        );
        assert_eq!(x.unwrap(), 4);
        assert_eq!(y.unwrap(), 4);
        assert_eq!(s.get_chunk_status(id).await.unwrap().committed_bytes, 4);
    }

    #[tokio::test]
    async fn file_backed_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(NetworkShim::new());
        let mut replicas: Vec<Arc<dyn ChunkService>> = Vec::new();
        for address in ["a:1", "b:1"] {
            let storage = FileStorage::new(dir.path().join(address.replace(':', "_")), 1024).unwrap();
            let cs: Arc<dyn ChunkService> =
                Arc::new(Chunkserver::new(address.into(), None, network.clone(), storage));
            network.add_node(address, &cs);
            replicas.push(cs);
        }
        let (a, b) = (&replicas[0], &replicas[1]);
        let id = ChunkId::new();
        a.create_chunk(id, 6, ReplicaRole::Primary, None).await.unwrap();
        b.create_chunk(id, 6, ReplicaRole::Secondary, Some("a:1".into()))
            .await
            .unwrap();
        a.set_replicas(id, vec!["b:1".into()]).await.unwrap();

        a.write_chunk(id, 0, b"abc".to_vec()).await.unwrap();
        a.write_chunk(id, 3, b"def".to_vec()).await.unwrap();
        for replica in [a, b] {
            assert_eq!(replica.read_chunk(id, 1, 4).await.unwrap(), b"bcde");
            let info = replica.get_chunk_status(id).await.unwrap();
            assert_eq!(info.status, ChunkStatus::Committed);
            assert_eq!(info.checksum, crc32fast::hash(b"abcdef"));
        }
    }
}
