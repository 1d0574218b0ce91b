//! Client library: turns byte streams into blobs and back.
//!
//! Uploads write each chunk serially to its primary, with several chunks in
//! flight at once. Downloads read chunk by chunk, failing over between
//! replicas.

pub mod retry;

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::chunk::ChunkInfo;
use crate::common::{BlobId, ChunkId};
use crate::config::{ClientConfig, Config};
use crate::controller::registry::ChunkServerInfo;
use crate::controller::{chunk_layout, BlobMetadata, BlobStatus, ChunkRef};
use crate::error::{PfsError, Result};
use crate::network::{ControllerService, Network};

use self::retry::{with_retries, ExponentialBackoff};

/// One replica's answer to GetChunkStatus.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    pub address: String,
    /// The replica's chunk status, or why it could not be fetched.
    pub info: std::result::Result<ChunkInfo, String>,
}

#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub chunk_id: ChunkId,
    pub replicas: Vec<ReplicaState>,
}

impl ChunkReport {
    /// Every replica answered with the same committed length and checksum.
    pub fn is_consistent(&self) -> bool {
        let mut seen: Option<(u64, u32)> = None;
        for replica in &self.replicas {
            let Ok(info) = &replica.info else {
                return false;
            };
            let current = (info.committed_bytes, info.checksum);
            match seen {
                Some(first) if first != current => return false,
                _ => seen = Some(current),
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub blob_id: BlobId,
    pub status: BlobStatus,
    pub chunks: Vec<ChunkReport>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.chunks.iter().all(ChunkReport::is_consistent)
    }
}

pub struct Client {
    controller: String,
    network: Arc<dyn Network>,
    chunk_capacity: u64,
    config: ClientConfig,
    /// Metadata of Sealed blobs, which never changes.
    metadata: Option<Mutex<LruCache<BlobId, BlobMetadata>>>,
}

impl Client {
    pub fn new(config: &Config, network: Arc<dyn Network>) -> Client {
        Client {
            controller: config.controller_address.clone(),
            network,
            chunk_capacity: config.chunk_capacity,
            config: config.client.clone(),
            metadata: NonZeroUsize::new(config.client.metadata_cache)
                .map(|n| Mutex::new(LruCache::new(n))),
        }
    }

    fn controller(&self) -> Result<Arc<dyn ControllerService>> {
        self.network.controller(&self.controller)
    }

    /// Chunk sizes for a blob, checked against the controller's layout.
    fn layout(&self, meta: &BlobMetadata) -> Result<Vec<u64>> {
        let layout = chunk_layout(meta.size_bytes, self.chunk_capacity)?;
        if layout.len() != meta.chunks.len() {
            return Err(PfsError::Config(format!(
                "blob {} has {} chunks but a chunk capacity of {} bytes implies {}; \
                 client and controller chunk_capacity differ",
                meta.blob_id,
                meta.chunks.len(),
                self.chunk_capacity,
                layout.len()
            )));
        }
        Ok(layout)
    }

    /// Store `data` as a new blob with `replicas` copies of every chunk
    /// (zero means the controller's default).
    pub async fn upload(&self, data: &[u8], replicas: u32) -> Result<BlobMetadata> {
        self.upload_reader(data, data.len() as u64, replicas).await
    }

    /// Store exactly `len` bytes read from `reader` as a new blob.
    ///
    /// Chunks are read in order; up to `concurrency` of them are written in
    /// parallel. On failure the blob is left in New state.
    pub async fn upload_reader<R>(&self, mut reader: R, len: u64, replicas: u32) -> Result<BlobMetadata>
    where
        R: AsyncRead + Unpin,
    {
        let meta = self.controller()?.create_blob(len, replicas).await?;
        let layout = self.layout(&meta)?;
        let blob_id = meta.blob_id;
        info!(%blob_id, size_bytes = len, chunks = layout.len(), "uploading blob");

        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for (chunk_index, (chunk, size)) in meta.chunks.iter().zip(layout).enumerate() {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PfsError::Io(std::io::Error::other(e)))?;
            while let Some(finished) = tasks.try_join_next() {
                flatten(finished)?;
            }

            let mut data = vec![0u8; size as usize];
            reader.read_exact(&mut data).await?;

            let network = self.network.clone();
            let chunk = chunk.clone();
            let write_size = self.config.write_size as usize;
            let backoff = ExponentialBackoff::from_config(&self.config);
            tasks.spawn(async move {
                let _permit = permit;
                write_chunk_data(network.as_ref(), &chunk, &data, write_size, backoff)
                    .await
                    .map_err(|e| PfsError::UploadIncomplete {
                        blob_id,
                        chunk_index,
                        source: Box::new(e),
                    })
            });
        }

        while let Some(finished) = tasks.join_next().await {
            flatten(finished)?;
        }

        let meta = self.controller()?.get_blob_metadata(blob_id).await?;
        info!(%blob_id, status = ?meta.status, "upload complete");
        Ok(meta)
    }

    /// Blob metadata, served from the cache once the blob is Sealed.
    pub async fn stat(&self, blob_id: BlobId) -> Result<BlobMetadata> {
        if let Some(cache) = &self.metadata {
            if let Some(meta) = cache.lock().get(&blob_id) {
                return Ok(meta.clone());
            }
        }
        let meta = self.controller()?.get_blob_metadata(blob_id).await?;
        if meta.status == BlobStatus::Sealed {
            if let Some(cache) = &self.metadata {
                cache.lock().put(blob_id, meta.clone());
            }
        }
        Ok(meta)
    }

    /// Read a whole blob into memory.
    pub async fn download(&self, blob_id: BlobId) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.download_to(blob_id, &mut out).await?;
        Ok(out)
    }

    /// Stream a blob into `writer`, returning the number of bytes written.
    pub async fn download_to<W>(&self, blob_id: BlobId, mut writer: W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let meta = self.stat(blob_id).await?;
        let layout = self.layout(&meta)?;

        let mut total = 0;
        for (chunk_index, (chunk, size)) in meta.chunks.iter().zip(layout).enumerate() {
            let data = self.read_chunk(chunk, size).await.map_err(|reasons| {
                PfsError::DownloadIncomplete(format!(
                    "blob {blob_id} chunk {chunk_index} ({}): {}",
                    chunk.chunk_id,
                    reasons.join("; ")
                ))
            })?;
            writer.write_all(&data).await?;
            total += data.len() as u64;
        }
        writer.flush().await?;
        debug!(%blob_id, bytes = total, "download complete");
        Ok(total)
    }

    /// Read `size` bytes of a chunk from the first replica able to serve all
    /// of them. On failure returns one reason per replica.
    async fn read_chunk(&self, chunk: &ChunkRef, size: u64) -> std::result::Result<Vec<u8>, Vec<String>> {
        let mut reasons = Vec::new();
        for replica in &chunk.replicas {
            match self.read_chunk_from(replica, chunk.chunk_id, size).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!(chunk_id = %chunk.chunk_id, %replica, error = %e, "replica read failed");
                    reasons.push(format!("{replica}: {e}"));
                }
            }
        }
        if chunk.replicas.is_empty() {
            reasons.push("no replicas".to_string());
        }
        Err(reasons)
    }

    async fn read_chunk_from(&self, replica: &str, chunk_id: ChunkId, size: u64) -> Result<Vec<u8>> {
        let service = self.network.chunk_server(replica)?;
        let mut data = Vec::with_capacity(size as usize);
        while (data.len() as u64) < size {
            let offset = data.len() as u64;
            let want = (size - offset).min(self.config.read_size);
            let piece = service.read_chunk(chunk_id, offset, want).await?;
            if piece.is_empty() {
                return Err(PfsError::DownloadIncomplete(format!(
                    "replica holds {offset} of {size} bytes"
                )));
            }
            data.extend_from_slice(&piece);
        }
        Ok(data)
    }

    /// Compare every replica of every chunk of a blob.
    pub async fn verify(&self, blob_id: BlobId) -> Result<VerifyReport> {
        let meta = self.controller()?.get_blob_metadata(blob_id).await?;
        let mut chunks = Vec::with_capacity(meta.chunks.len());
        for chunk in &meta.chunks {
            let mut replicas = Vec::with_capacity(chunk.replicas.len());
            for address in &chunk.replicas {
                let info = match self.network.chunk_server(address) {
                    Ok(service) => service.get_chunk_status(chunk.chunk_id).await,
                    Err(e) => Err(e),
                };
                replicas.push(ReplicaState {
                    address: address.clone(),
                    info: info.map_err(|e| e.to_string()),
                });
            }
            chunks.push(ChunkReport {
                chunk_id: chunk.chunk_id,
                replicas,
            });
        }
        Ok(VerifyReport {
            blob_id,
            status: meta.status,
            chunks,
        })
    }

    pub async fn list_servers(&self) -> Result<Vec<ChunkServerInfo>> {
        self.controller()?.list_chunk_servers().await
    }
}

/// Write one chunk's bytes to its primary in pieces of at most `write_size`,
/// retrying each piece under `backoff`.
async fn write_chunk_data(
    network: &dyn Network,
    chunk: &ChunkRef,
    data: &[u8],
    write_size: usize,
    backoff: ExponentialBackoff,
) -> Result<()> {
    let primary = chunk.primary().ok_or_else(|| {
        PfsError::InvalidArgument(format!("chunk {} has no replicas", chunk.chunk_id))
    })?;
    let chunk_id = chunk.chunk_id;

    let mut offset = 0u64;
    for piece in data.chunks(write_size) {
        let written = with_retries(backoff.clone(), move || async move {
            network
                .chunk_server(primary)?
                .write_chunk(chunk_id, offset, piece.to_vec())
                .await
        })
        .await?;
        if written != piece.len() as u64 {
            return Err(PfsError::WriteOutOfOrder(format!(
                "chunk {chunk_id}: {written} bytes acknowledged at offset {offset}, sent {}",
                piece.len()
            )));
        }
        offset += written;
    }
    debug!(%chunk_id, %primary, bytes = offset, "chunk written");
    Ok(())
}

fn flatten(finished: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match finished {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(PfsError::Io(std::io::Error::other(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunkserver::Chunkserver;
    use crate::controller::Controller;
    use crate::network::{ChunkService, NetworkShim};
    use crate::storage::MemoryStorage;

    struct Cluster {
        network: Arc<NetworkShim>,
        client: Client,
        _controller: Arc<dyn ControllerService>,
        servers: Vec<Arc<dyn ChunkService>>,
    }

    async fn cluster(num_servers: usize, config: Config) -> Cluster {
        let network = Arc::new(NetworkShim::new());
        let controller: Arc<dyn ControllerService> =
            Arc::new(Controller::with_seed(&config, network.clone(), 1));
        network.add_controller(&config.controller_address, &controller);

        let mut servers = Vec::new();
        for i in 0..num_servers {
            let address = format!("cs{i}:1");
            let cs = Arc::new(Chunkserver::new(
                address.clone(),
                Some(config.controller_address.clone()),
                network.clone(),
                MemoryStorage::new(1 << 20),
            ));
            cs.register().await.unwrap();
            let cs: Arc<dyn ChunkService> = cs;
            network.add_node(&address, &cs);
            servers.push(cs);
        }
        let client = Client::new(&config, network.clone());
        Cluster {
            network,
            client,
            _controller: controller,
            servers,
        }
    }

    fn small_config() -> Config {
        let mut config = Config {
            chunk_capacity: 8,
            ..Config::default()
        };
        config.client.write_size = 3;
        config.client.read_size = 5;
        config.client.retry_initial_backoff_ms = 1;
        config.client.retry_max_backoff_ms = 2;
        config
    }

    #[tokio::test]
    async fn upload_then_download() {
        let c = cluster(3, small_config()).await;
        let data: Vec<u8> = (0..50u8).collect();
        let meta = c.client.upload(&data, 2).await.unwrap();
        assert_eq!(meta.status, BlobStatus::Sealed);
        assert_eq!(meta.chunks.len(), 7);
        assert_eq!(c.client.download(meta.blob_id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn download_fails_over_to_secondary() {
        let c = cluster(3, small_config()).await;
        let data = b"replicated bytes".to_vec();
        let meta = c.client.upload(&data, 3).await.unwrap();
        c.network.disconnect(meta.chunks[0].primary().unwrap());
        assert_eq!(c.client.download(meta.blob_id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn download_without_replicas_is_incomplete() {
        let c = cluster(2, small_config()).await;
        let meta = c.client.upload(b"abc", 1).await.unwrap();
        c.network.disconnect(&meta.chunks[0].replicas[0]);
        assert!(matches!(
            c.client.download(meta.blob_id).await,
            Err(PfsError::DownloadIncomplete(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_primary_leaves_upload_incomplete() {
        let mut config = small_config();
        config.client.max_attempts = 2;
        let c = cluster(2, config.clone()).await;

        // The client sees the controller but none of the chunk servers.
        let client_network = Arc::new(NetworkShim::new());
        let controller = c.network.controller(&config.controller_address).unwrap();
        client_network.add_controller(&config.controller_address, &controller);
        let client = Client::new(&config, client_network);

        let err = client.upload(b"0123456789", 2).await.unwrap_err();
        match err {
            PfsError::UploadIncomplete { source, .. } => {
                assert!(matches!(*source, PfsError::Unreachable { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stat_caches_sealed_blobs() {
        let c = cluster(1, small_config()).await;
        let meta = c.client.upload(b"hello", 1).await.unwrap();
        assert_eq!(c.client.stat(meta.blob_id).await.unwrap(), meta);
        c.network.disconnect("127.0.0.1:4100");
        assert_eq!(c.client.stat(meta.blob_id).await.unwrap(), meta);
    }

    #[tokio::test]
    async fn capacity_mismatch_is_reported() {
        let c = cluster(1, small_config()).await;
        let meta = c.client.upload(b"0123456789", 1).await.unwrap();
        let mut other = small_config();
        other.chunk_capacity = 4;
        let client = Client::new(&other, c.network.clone());
        assert!(matches!(
            client.download(meta.blob_id).await,
            Err(PfsError::Config(_))
        ));
    }

    #[tokio::test]
    async fn verify_compares_replicas() {
        let c = cluster(3, small_config()).await;
        let meta = c.client.upload(b"0123456789", 3).await.unwrap();
        let report = c.client.verify(meta.blob_id).await.unwrap();
        assert_eq!(report.chunks.len(), 2);
        assert!(report.is_consistent());

        c.network.disconnect("cs2:1");
        let report = c.client.verify(meta.blob_id).await.unwrap();
        assert!(!report.is_consistent());
        assert_eq!(c.client.list_servers().await.unwrap().len(), 3);
        assert_eq!(c.servers.len(), 3);
    }
}
