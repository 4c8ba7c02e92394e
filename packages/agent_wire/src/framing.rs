//! Length-prefixed UTF-8 frames over a byte stream.
//!
//! Wire format: `[4-byte big-endian length][UTF-8 payload]`. The
//! transport carries opaque frames; classification happens above in
//! [`crate::wire`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;

/// Maximum frame size (1 MiB). Frames larger than this are rejected.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Write one frame with its length prefix.
pub async fn write_frame<W>(stream: &mut W, text: &str) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = text.as_bytes();
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            len: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = (bytes.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `None` if the stream is cleanly closed at a frame boundary.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<String>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| WireError::InvalidUtf8)
}
