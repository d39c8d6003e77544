//! Length-prefixed framing of [`SyncFrame`]s over byte streams.

use crate::protocol::SyncFrame;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reads one length-prefixed frame. Returns `None` on a clean end of stream
/// between frames.
pub async fn read_frame<T: AsyncRead + Unpin>(io: &mut T) -> io::Result<Option<SyncFrame>> {
    // Read 4-byte length prefix
    let mut len_bytes = [0u8; 4];
    match io.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;

    SyncFrame::decode(&buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Writes one length-prefixed frame and flushes.
pub async fn write_frame<T: AsyncWrite + Unpin>(io: &mut T, frame: &SyncFrame) -> io::Result<()> {
    let data = frame
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", data.len()),
        ));
    }

    io.write_all(&(data.len() as u32).to_be_bytes()).await?;
    io.write_all(&data).await?;
    io.flush().await?;
    Ok(())
}
