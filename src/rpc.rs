//! RPC plumbing between clients, the controller and chunk servers.
//!
//! Every exchange is one request frame answered by one response frame on a
//! TCP connection; see [`frame`] for the framing and [`proto`] for the
//! message encoding.

pub mod frame;
pub mod proto;
pub mod remote;
pub mod server;

pub use remote::{RemoteChunkServer, RemoteController, RpcClient};
pub use server::{serve, ChunkServiceHandler, ControllerHandler, RpcHandler};
