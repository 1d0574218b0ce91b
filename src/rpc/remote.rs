//! Client-side stubs for remote services.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::debug;

use crate::chunk::{ChunkInfo, ReplicaRole};
use crate::common::{BlobId, ChunkId};
use crate::controller::registry::ChunkServerInfo;
use crate::controller::BlobMetadata;
use crate::error::{PfsError, Result};
use crate::network::{ChunkService, ControllerService};
use crate::rpc::frame::{read_frame, write_frame};
use crate::rpc::proto::{decode, encode, Reply, Request, Response};

/// Idle connections kept per remote address.
const MAX_IDLE_CONNECTIONS: usize = 8;

/// How a single request/response exchange failed.
enum RoundTripError {
    /// The connection broke before any of the response arrived; the request
    /// may be resent on a fresh connection.
    BeforeResponse(PfsError),
    Failed(PfsError),
}

impl RoundTripError {
    fn into_inner(self) -> PfsError {
        match self {
            RoundTripError::BeforeResponse(e) | RoundTripError::Failed(e) => e,
        }
    }
}

fn is_broken_connection(err: &PfsError) -> bool {
    match err {
        PfsError::Io(e) => matches!(
            e.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

fn unexpected(method: &str) -> PfsError {
    PfsError::Wire(format!("unexpected reply to {method}"))
}

/// Issues framed requests to one address under a deadline.
pub struct RpcClient {
    address: String,
    timeout: Duration,
    idle: Mutex<Vec<TcpStream>>,
}

impl RpcClient {
    pub fn new(address: String, timeout: Duration) -> RpcClient {
        RpcClient {
            address,
            timeout,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one request and wait for its reply.
    ///
    /// Transport failures and deadline expiry surface as
    /// [`PfsError::Unreachable`]; errors raised by the remote service come
    /// back as their own variants.
    pub async fn call(&self, request: Request) -> Result<Reply> {
        let method = request.method();
        let payload = encode(&request)?;

        let exchange = tokio::time::timeout(self.timeout, self.exchange(&payload))
            .await
            .map_err(|_| PfsError::unreachable(&self.address, format!("{method} deadline exceeded")))?;
        let response = exchange.map_err(|e| match e {
            PfsError::Io(io) => PfsError::unreachable(&self.address, io),
            other => other,
        })?;

        decode::<Response>(&response)?.into_result()
    }

    /// Send a request whose only answer is success or an error.
    async fn call_done(&self, request: Request) -> Result<()> {
        let method = request.method();
        match self.call(request).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected(method)),
        }
    }

    /// Run one exchange, preferring an idle pooled connection. A pooled
    /// connection the peer has since closed is replaced by a fresh one and
    /// the request resent once.
    async fn exchange(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let pooled = self.idle.lock().pop();
        if let Some(stream) = pooled {
            match self.round_trip(stream, payload).await {
                Ok(response) => return Ok(response),
                Err(RoundTripError::BeforeResponse(e)) => {
                    debug!(address = %self.address, error = %e, "pooled connection closed; redialling");
                }
                Err(RoundTripError::Failed(e)) => return Err(e),
            }
        }

        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        self.round_trip(stream, payload)
            .await
            .map_err(RoundTripError::into_inner)
    }

    async fn round_trip(
        &self,
        mut stream: TcpStream,
        payload: &[u8],
    ) -> std::result::Result<Vec<u8>, RoundTripError> {
        if let Err(e) = write_frame(&mut stream, payload).await {
            return Err(match e {
                PfsError::Io(_) => RoundTripError::BeforeResponse(e),
                other => RoundTripError::Failed(other),
            });
        }
        let response = match read_frame(&mut stream).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                return Err(RoundTripError::BeforeResponse(PfsError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed before response",
                ))))
            }
            Err(e) if is_broken_connection(&e) => return Err(RoundTripError::BeforeResponse(e)),
            Err(e) => return Err(RoundTripError::Failed(e)),
        };

        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(stream);
        }
        Ok(response)
    }
}

/// A chunk server reached over TCP.
pub struct RemoteChunkServer {
    client: Arc<RpcClient>,
}

impl RemoteChunkServer {
    pub fn new(client: Arc<RpcClient>) -> Self {
        RemoteChunkServer { client }
    }
}

#[async_trait]
impl ChunkService for RemoteChunkServer {
    async fn create_chunk(
        &self,
        chunk_id: ChunkId,
        size: u64,
        role: ReplicaRole,
        primary_address: Option<String>,
    ) -> Result<()> {
        self.client
            .call_done(Request::CreateChunk {
                chunk_id,
                size,
                role,
                primary_address,
            })
            .await
    }

    async fn set_replicas(&self, chunk_id: ChunkId, secondaries: Vec<String>) -> Result<()> {
        self.client
            .call_done(Request::SetReplicas {
                chunk_id,
                secondaries,
            })
            .await
    }

    async fn write_chunk(&self, chunk_id: ChunkId, offset: u64, data: Vec<u8>) -> Result<u64> {
        let request = Request::WriteChunk {
            chunk_id,
            offset,
            data,
        };
        match self.client.call(request).await? {
            Reply::BytesWritten(n) => Ok(n),
            _ => Err(unexpected("WriteChunk")),
        }
    }

    async fn read_chunk(&self, chunk_id: ChunkId, offset: u64, num_bytes: u64) -> Result<Vec<u8>> {
        let request = Request::ReadChunk {
            chunk_id,
            offset,
            num_bytes,
        };
        match self.client.call(request).await? {
            Reply::Data(data) => Ok(data),
            _ => Err(unexpected("ReadChunk")),
        }
    }

    async fn get_chunk_status(&self, chunk_id: ChunkId) -> Result<ChunkInfo> {
        match self.client.call(Request::GetChunkStatus { chunk_id }).await? {
            Reply::ChunkStatus(info) => Ok(info),
            _ => Err(unexpected("GetChunkStatus")),
        }
    }

    async fn delete_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        self.client.call_done(Request::DeleteChunk { chunk_id }).await
    }

    async fn list_chunks(&self) -> Result<Vec<ChunkId>> {
        match self.client.call(Request::ListChunks).await? {
            Reply::ChunkIds(ids) => Ok(ids),
            _ => Err(unexpected("ListChunks")),
        }
    }
}

/// The controller reached over TCP.
pub struct RemoteController {
    client: Arc<RpcClient>,
}

impl RemoteController {
    pub fn new(client: Arc<RpcClient>) -> Self {
        RemoteController { client }
    }
}

#[async_trait]
impl ControllerService for RemoteController {
    async fn add_chunk_server(&self, address: String) -> Result<()> {
        self.client.call_done(Request::AddChunkServer { address }).await
    }

    async fn create_blob(&self, size_bytes: u64, num_replicas: u32) -> Result<BlobMetadata> {
        let request = Request::CreateBlob {
            size_bytes,
            num_replicas,
        };
        match self.client.call(request).await? {
            Reply::Blob(meta) => Ok(meta),
            _ => Err(unexpected("CreateBlob")),
        }
    }

    async fn get_blob_metadata(&self, blob_id: BlobId) -> Result<BlobMetadata> {
        match self.client.call(Request::GetBlobMetadata { blob_id }).await? {
            Reply::Blob(meta) => Ok(meta),
            _ => Err(unexpected("GetBlobMetadata")),
        }
    }

    async fn report_chunk_committed(&self, chunk_id: ChunkId, address: String) -> Result<()> {
        self.client
            .call_done(Request::ReportChunkCommitted { chunk_id, address })
            .await
    }

    async fn list_chunk_servers(&self) -> Result<Vec<ChunkServerInfo>> {
        match self.client.call(Request::ListChunkServers).await? {
            Reply::ChunkServers(servers) => Ok(servers),
            _ => Err(unexpected("ListChunkServers")),
        }
    }

    async fn remove_chunk_server(&self, address: String) -> Result<()> {
        self.client
            .call_done(Request::RemoveChunkServer { address })
            .await
    }
}
