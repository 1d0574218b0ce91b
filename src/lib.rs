//! pfs: a replicated, chunked blob store.
//!
//! A controller keeps the registry of chunk servers and blobs and decides
//! where each chunk's replicas live. Chunk servers hold fixed-capacity chunk
//! buffers and replicate writes from a primary to its secondaries. The
//! client splits a byte stream into chunks, writes each to its primary and
//! reads blobs back with replica fail-over.

pub mod chunk;
pub mod chunkserver;
pub mod client;
pub mod common;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod network;
pub mod rpc;
pub mod storage;

pub use crate::client::Client;
pub use crate::common::{BlobId, ChunkId};
pub use crate::config::Config;
pub use crate::controller::{BlobMetadata, BlobStatus, ChunkRef, Controller};
pub use crate::error::{PfsError, Result};
pub use crate::network::{ChunkService, ControllerService, Network, NetworkShim, TcpNetwork};
