//! Full-read and full-write helpers over a byte stream.
//!
//! A single `read` or `write` on a socket may move fewer bytes than asked
//! for. These helpers loop until the whole frame has moved, and report a
//! peer that hangs up mid-frame as `Ok(None)` rather than as an error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Reads exactly `n` bytes.
///
/// Returns `Ok(None)` when the peer closes before `n` bytes have arrived;
/// whatever was buffered up to that point is discarded.
pub async fn read_exact<R>(reader: &mut R, n: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let read = reader.read(&mut buffer[filled..]).await?;
        if read == 0 {
            return Ok(None);
        }
        filled += read;
    }
    Ok(Some(buffer))
}

/// Reads a single byte, `Ok(None)` if the peer has closed.
pub async fn read_u8<R>(reader: &mut R) -> Result<Option<u8>>
where
    R: AsyncRead + Unpin,
{
    Ok(read_exact(reader, 1).await?.map(|bytes| bytes[0]))
}

/// Reads a big-endian `u32`, `Ok(None)` if the peer has closed.
pub async fn read_u32<R>(reader: &mut R) -> Result<Option<u32>>
where
    R: AsyncRead + Unpin,
{
    let Some(bytes) = read_exact(reader, 4).await? else {
        return Ok(None);
    };
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes);
    Ok(Some(u32::from_be_bytes(word)))
}

/// Writes every byte of `bytes`, then flushes.
///
/// A write that makes no progress while bytes remain means the connection
/// is gone and yields [`ProtocolError::BrokenPipe`].
pub async fn write_all<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < bytes.len() {
        let sent = writer.write(&bytes[written..]).await?;
        if sent == 0 {
            return Err(ProtocolError::BrokenPipe);
        }
        written += sent;
    }
    writer.flush().await?;
    Ok(())
}
