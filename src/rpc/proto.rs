//! RPC messages.
//!
//! A request frame carries one [`Request`]; the answer frame carries one
//! [`Response`]. Both are encoded with postcard, so the order of variants and
//! fields below is part of the wire contract: append, never reorder.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkInfo, ReplicaRole};
use crate::common::{BlobId, ChunkId};
use crate::controller::registry::ChunkServerInfo;
use crate::controller::BlobMetadata;
use crate::error::{PfsError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    // Controller.
    AddChunkServer {
        address: String,
    },
    CreateBlob {
        size_bytes: u64,
        num_replicas: u32,
    },
    GetBlobMetadata {
        blob_id: BlobId,
    },
    ReportChunkCommitted {
        chunk_id: ChunkId,
        address: String,
    },
    ListChunkServers,
    RemoveChunkServer {
        address: String,
    },

    // Chunk server.
    CreateChunk {
        chunk_id: ChunkId,
        size: u64,
        role: ReplicaRole,
        primary_address: Option<String>,
    },
    SetReplicas {
        chunk_id: ChunkId,
        secondaries: Vec<String>,
    },
    WriteChunk {
        chunk_id: ChunkId,
        offset: u64,
        data: Vec<u8>,
    },
    ReadChunk {
        chunk_id: ChunkId,
        offset: u64,
        num_bytes: u64,
    },
    GetChunkStatus {
        chunk_id: ChunkId,
    },
    DeleteChunk {
        chunk_id: ChunkId,
    },
    ListChunks,
}

impl Request {
    /// Method name, for logs and error messages.
    pub fn method(&self) -> &'static str {
        match self {
            Request::AddChunkServer { .. } => "AddChunkServer",
            Request::CreateBlob { .. } => "CreateBlob",
            Request::GetBlobMetadata { .. } => "GetBlobMetadata",
            Request::ReportChunkCommitted { .. } => "ReportChunkCommitted",
            Request::ListChunkServers => "ListChunkServers",
            Request::RemoveChunkServer { .. } => "RemoveChunkServer",
            Request::CreateChunk { .. } => "CreateChunk",
            Request::SetReplicas { .. } => "SetReplicas",
            Request::WriteChunk { .. } => "WriteChunk",
            Request::ReadChunk { .. } => "ReadChunk",
            Request::GetChunkStatus { .. } => "GetChunkStatus",
            Request::DeleteChunk { .. } => "DeleteChunk",
            Request::ListChunks => "ListChunks",
        }
    }
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Done,
    Blob(BlobMetadata),
    ChunkServers(Vec<ChunkServerInfo>),
    BytesWritten(u64),
    Data(Vec<u8>),
    ChunkStatus(ChunkInfo),
    ChunkIds(Vec<ChunkId>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ok(Reply),
    /// `code` is an [`crate::error::ErrorCode`].
    Err { code: u32, message: String },
}

impl From<Result<Reply>> for Response {
    fn from(result: Result<Reply>) -> Self {
        match result {
            Ok(reply) => Response::Ok(reply),
            Err(e) => Response::Err {
                code: e.code() as u32,
                message: e.wire_message(),
            },
        }
    }
}

impl Response {
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Response::Ok(reply) => Ok(reply),
            Response::Err { code, message } => Err(PfsError::from_wire(code, message)),
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(message)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(postcard::from_bytes(bytes)?)
}
