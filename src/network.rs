//! Service interfaces and how components find each other.
//!
//! Components only ever address one another by `host:port` string. A
//! [`Network`] turns an address into a handle implementing the remote
//! service: [`TcpNetwork`] dials real servers, [`NetworkShim`] routes to
//! services living in the same process.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::chunk::{ChunkInfo, ReplicaRole};
use crate::common::{validate_address, BlobId, ChunkId};
use crate::controller::registry::ChunkServerInfo;
use crate::controller::BlobMetadata;
use crate::error::{PfsError, Result};
use crate::rpc::{RemoteChunkServer, RemoteController, RpcClient};

/// Operations a chunk server answers.
#[async_trait]
pub trait ChunkService: Send + Sync {
    async fn create_chunk(
        &self,
        chunk_id: ChunkId,
        size: u64,
        role: ReplicaRole,
        primary_address: Option<String>,
    ) -> Result<()>;

    /// Tell a primary which secondaries to forward writes to, in replica
    /// order. Sent by the controller once every replica is placed.
    async fn set_replicas(&self, chunk_id: ChunkId, secondaries: Vec<String>) -> Result<()>;

    /// Returns the number of bytes the write covers.
    async fn write_chunk(&self, chunk_id: ChunkId, offset: u64, data: Vec<u8>) -> Result<u64>;

    async fn read_chunk(&self, chunk_id: ChunkId, offset: u64, num_bytes: u64) -> Result<Vec<u8>>;

    async fn get_chunk_status(&self, chunk_id: ChunkId) -> Result<ChunkInfo>;

    async fn delete_chunk(&self, chunk_id: ChunkId) -> Result<()>;

    async fn list_chunks(&self) -> Result<Vec<ChunkId>>;
}

/// Operations the controller answers.
#[async_trait]
pub trait ControllerService: Send + Sync {
    async fn add_chunk_server(&self, address: String) -> Result<()>;

    async fn create_blob(&self, size_bytes: u64, num_replicas: u32) -> Result<BlobMetadata>;

    async fn get_blob_metadata(&self, blob_id: BlobId) -> Result<BlobMetadata>;

    async fn report_chunk_committed(&self, chunk_id: ChunkId, address: String) -> Result<()>;

    async fn list_chunk_servers(&self) -> Result<Vec<ChunkServerInfo>>;

    async fn remove_chunk_server(&self, address: String) -> Result<()>;
}

pub trait Network: Send + Sync {
    fn chunk_server(&self, address: &str) -> Result<Arc<dyn ChunkService>>;

    fn controller(&self, address: &str) -> Result<Arc<dyn ControllerService>>;
}

/// Reaches services over TCP, keeping one connection pool per address.
pub struct TcpNetwork {
    timeout: Duration,
    clients: Mutex<HashMap<String, Arc<RpcClient>>>,
}

impl TcpNetwork {
    pub fn new(timeout: Duration) -> TcpNetwork {
        TcpNetwork {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, address: &str) -> Result<Arc<RpcClient>> {
        validate_address(address)?;
        let mut clients = self.clients.lock();
        let client = clients
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(RpcClient::new(address.to_string(), self.timeout)));
        Ok(client.clone())
    }
}

impl Network for TcpNetwork {
    fn chunk_server(&self, address: &str) -> Result<Arc<dyn ChunkService>> {
        Ok(Arc::new(RemoteChunkServer::new(self.client(address)?)))
    }

    fn controller(&self, address: &str) -> Result<Arc<dyn ControllerService>> {
        Ok(Arc::new(RemoteController::new(self.client(address)?)))
    }
}

/// In-process network: routes addresses to services registered in the same
/// process.
///
/// Services are held weakly, so dropping the last handle to a service makes
/// its address unreachable, as a crashed process would be.
#[derive(Default)]
pub struct NetworkShim {
    nodes: RwLock<HashMap<String, Weak<dyn ChunkService>>>,
    controllers: RwLock<HashMap<String, Weak<dyn ControllerService>>>,
}

impl NetworkShim {
    pub fn new() -> NetworkShim {
        NetworkShim::default()
    }

    pub fn add_node(&self, address: &str, chunkserver: &Arc<dyn ChunkService>) {
        self.nodes
            .write()
            .insert(address.to_string(), Arc::downgrade(chunkserver));
    }

    pub fn add_controller(&self, address: &str, controller: &Arc<dyn ControllerService>) {
        self.controllers
            .write()
            .insert(address.to_string(), Arc::downgrade(controller));
    }

    /// Make an address unreachable without dropping the service behind it.
    pub fn disconnect(&self, address: &str) {
        self.nodes.write().remove(address);
        self.controllers.write().remove(address);
    }
}

impl Network for NetworkShim {
    fn chunk_server(&self, address: &str) -> Result<Arc<dyn ChunkService>> {
        self.nodes
            .read()
            .get(address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| PfsError::unreachable(address, "no such node"))
    }

    fn controller(&self, address: &str) -> Result<Arc<dyn ControllerService>> {
        self.controllers
            .read()
            .get(address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| PfsError::unreachable(address, "no such controller"))
    }
}
