//! Domain errors shared by the controller, chunk servers and client.

use crate::common::BlobId;

/// Errors surfaced by every pfs operation.
///
/// Each variant maps to a stable [`ErrorCode`] so that an error raised by a
/// remote service is reconstructed as the same variant on the caller's side.
#[derive(Debug, thiserror::Error)]
pub enum PfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The controller cannot meet the requested replica count.
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// The chunk server cannot allocate another chunk buffer.
    #[error("out of capacity: {0}")]
    OutOfCapacity(String),

    #[error("write out of order: {0}")]
    WriteOutOfOrder(String),

    #[error("write overflows capacity: {0}")]
    OverflowsCapacity(String),

    #[error("replication failed: {0}")]
    ReplicationFailed(String),

    #[error("{address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("malformed address: {0:?}")]
    MalformedAddress(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("upload of blob {blob_id} incomplete at chunk {chunk_index}: {source}")]
    UploadIncomplete {
        blob_id: BlobId,
        chunk_index: usize,
        #[source]
        source: Box<PfsError>,
    },

    #[error("download incomplete: {0}")]
    DownloadIncomplete(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("wire error: {0}")]
    Wire(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An error code this build does not know, received from a peer.
    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PfsError>;

/// Numeric error codes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    NotFound = 1,
    AlreadyExists = 2,
    InsufficientCapacity = 3,
    OutOfCapacity = 4,
    WriteOutOfOrder = 5,
    OverflowsCapacity = 6,
    ReplicationFailed = 7,
    Unreachable = 8,
    MalformedAddress = 9,
    InvalidArgument = 10,
    Io = 11,
    Wire = 12,
    Internal = 13,
}

impl PfsError {
    /// Whether a caller may re-issue the same request.
    ///
    /// Writes are idempotent under monotonic offsets, so replication and
    /// transport failures are safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PfsError::ReplicationFailed(_) | PfsError::Unreachable { .. })
    }

    pub fn unreachable(address: impl Into<String>, reason: impl ToString) -> Self {
        PfsError::Unreachable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            PfsError::NotFound(_) => ErrorCode::NotFound,
            PfsError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            PfsError::InsufficientCapacity(_) => ErrorCode::InsufficientCapacity,
            PfsError::OutOfCapacity(_) => ErrorCode::OutOfCapacity,
            PfsError::WriteOutOfOrder(_) => ErrorCode::WriteOutOfOrder,
            PfsError::OverflowsCapacity(_) => ErrorCode::OverflowsCapacity,
            PfsError::ReplicationFailed(_) => ErrorCode::ReplicationFailed,
            PfsError::Unreachable { .. } => ErrorCode::Unreachable,
            PfsError::MalformedAddress(_) => ErrorCode::MalformedAddress,
            PfsError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            PfsError::Io(_) => ErrorCode::Io,
            PfsError::Wire(_) => ErrorCode::Wire,
            PfsError::UploadIncomplete { .. }
            | PfsError::DownloadIncomplete(_)
            | PfsError::Config(_)
            | PfsError::Remote { .. } => ErrorCode::Internal,
        }
    }

    /// The message carried next to the code on the wire.
    pub fn wire_message(&self) -> String {
        match self {
            PfsError::NotFound(m)
            | PfsError::AlreadyExists(m)
            | PfsError::InsufficientCapacity(m)
            | PfsError::OutOfCapacity(m)
            | PfsError::WriteOutOfOrder(m)
            | PfsError::OverflowsCapacity(m)
            | PfsError::ReplicationFailed(m)
            | PfsError::MalformedAddress(m)
            | PfsError::InvalidArgument(m)
            | PfsError::Wire(m) => m.clone(),
            // The remote side re-attributes the address to itself.
            PfsError::Unreachable { address, reason } => format!("{address}: {reason}"),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from an error response.
    pub fn from_wire(code: u32, message: String) -> Self {
        match code {
            1 => PfsError::NotFound(message),
            2 => PfsError::AlreadyExists(message),
            3 => PfsError::InsufficientCapacity(message),
            4 => PfsError::OutOfCapacity(message),
            5 => PfsError::WriteOutOfOrder(message),
            6 => PfsError::OverflowsCapacity(message),
            7 => PfsError::ReplicationFailed(message),
            8 => {
                let (address, reason) = match message.split_once(": ") {
                    Some((a, r)) => (a.to_string(), r.to_string()),
                    None => (String::new(), message),
                };
                PfsError::Unreachable { address, reason }
            }
            9 => PfsError::MalformedAddress(message),
            10 => PfsError::InvalidArgument(message),
            11 => PfsError::Io(std::io::Error::other(message)),
            12 => PfsError::Wire(message),
            code => PfsError::Remote { code, message },
        }
    }
}

impl From<postcard::Error> for PfsError {
    fn from(err: postcard::Error) -> Self {
        PfsError::Wire(err.to_string())
    }
}
