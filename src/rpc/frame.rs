//! Length-prefixed frames.
//!
//! ```text
//! +----------------+----------------+-----------------+
//! | len: u32 (BE)  | crc32: u32 (BE)| payload (len B) |
//! +----------------+----------------+-----------------+
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_IO_SIZE;
use crate::error::{PfsError, Result};

/// Largest accepted payload: one maximal read or write plus message overhead.
pub const MAX_FRAME_LEN: u32 = (MAX_IO_SIZE + 1024 * 1024) as u32;

/// Read one frame. Returns `None` when the peer closed the connection
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(PfsError::Wire(format!(
            "frame of {len} bytes exceeds limit {MAX_FRAME_LEN}"
        )));
    }
    let crc = reader.read_u32().await?;

    let mut payload = vec![0; len as usize];
    reader.read_exact(&mut payload).await?;
    if crc32fast::hash(&payload) != crc {
        return Err(PfsError::Wire("frame checksum mismatch".into()));
    }
    Ok(Some(payload))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| PfsError::Wire(format!("payload of {} bytes too large", payload.len())))?;

    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&len.to_be_bytes());
    header[4..].copy_from_slice(&crc32fast::hash(payload).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
