//! Serving loop and request dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace, warn};

use crate::error::{PfsError, Result};
use crate::network::{ChunkService, ControllerService};
use crate::rpc::frame::{read_frame, write_frame};
use crate::rpc::proto::{decode, encode, Reply, Request, Response};

/// Answers decoded requests.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Reply>;
}

/// Accept connections forever, serving each on its own task.
pub async fn serve(listener: TcpListener, handler: Arc<dyn RpcHandler>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "accepted connection");
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handler).await {
                warn!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn RpcHandler>) -> Result<()> {
    stream.set_nodelay(true)?;
    while let Some(frame) = read_frame(&mut stream).await? {
        let result = match decode::<Request>(&frame) {
            Ok(request) => {
                trace!(method = request.method(), "request");
                handler.handle(request).await
            }
            Err(e) => Err(e),
        };
        write_frame(&mut stream, &encode(&Response::from(result))?).await?;
    }
    Ok(())
}

fn unsupported(request: &Request) -> PfsError {
    PfsError::InvalidArgument(format!("{} is not served here", request.method()))
}

/// Serves a [`ChunkService`] over RPC.
pub struct ChunkServiceHandler(pub Arc<dyn ChunkService>);

#[async_trait]
impl RpcHandler for ChunkServiceHandler {
    async fn handle(&self, request: Request) -> Result<Reply> {
        let service = &self.0;
        match request {
            Request::CreateChunk {
                chunk_id,
                size,
                role,
                primary_address,
            } => {
                service.create_chunk(chunk_id, size, role, primary_address).await?;
                Ok(Reply::Done)
            }
            Request::SetReplicas {
                chunk_id,
                secondaries,
            } => {
                service.set_replicas(chunk_id, secondaries).await?;
                Ok(Reply::Done)
            }
            Request::WriteChunk {
                chunk_id,
                offset,
                data,
            } => Ok(Reply::BytesWritten(
                service.write_chunk(chunk_id, offset, data).await?,
            )),
            Request::ReadChunk {
                chunk_id,
                offset,
                num_bytes,
            } => Ok(Reply::Data(
                service.read_chunk(chunk_id, offset, num_bytes).await?,
            )),
            Request::GetChunkStatus { chunk_id } => {
                Ok(Reply::ChunkStatus(service.get_chunk_status(chunk_id).await?))
            }
            Request::DeleteChunk { chunk_id } => {
                service.delete_chunk(chunk_id).await?;
                Ok(Reply::Done)
            }
            Request::ListChunks => Ok(Reply::ChunkIds(service.list_chunks().await?)),
            other => Err(unsupported(&other)),
        }
    }
}

/// Serves a [`ControllerService`] over RPC.
pub struct ControllerHandler(pub Arc<dyn ControllerService>);

#[async_trait]
impl RpcHandler for ControllerHandler {
    async fn handle(&self, request: Request) -> Result<Reply> {
        let service = &self.0;
        match request {
            Request::AddChunkServer { address } => {
                service.add_chunk_server(address).await?;
                Ok(Reply::Done)
            }
            Request::CreateBlob {
                size_bytes,
                num_replicas,
            } => Ok(Reply::Blob(
                service.create_blob(size_bytes, num_replicas).await?,
            )),
            Request::GetBlobMetadata { blob_id } => {
                Ok(Reply::Blob(service.get_blob_metadata(blob_id).await?))
            }
            Request::ReportChunkCommitted { chunk_id, address } => {
                service.report_chunk_committed(chunk_id, address).await?;
                Ok(Reply::Done)
            }
            Request::ListChunkServers => {
                Ok(Reply::ChunkServers(service.list_chunk_servers().await?))
            }
            Request::RemoveChunkServer { address } => {
                service.remove_chunk_server(address).await?;
                Ok(Reply::Done)
            }
            other => Err(unsupported(&other)),
        }
    }
}
