//! Frame encoding.
//!
//! ```text
//! FRAME: [4 bytes BE: envelope_len][envelope_len bytes: JSON envelope]
//!
//! A `chunk` envelope is followed by exactly `size` raw body bytes.
//! ```

use barge_protocol::Message;
use barge_protocol::constants::MAX_HEADER_LEN;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ChannelError;

/// Writes one envelope frame. The caller flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), ChannelError> {
    let bytes = serde_json::to_vec(msg)?;
    if bytes.len() > MAX_HEADER_LEN {
        return Err(ChannelError::Protocol(format!(
            "envelope too large: {} bytes (max {MAX_HEADER_LEN})",
            bytes.len()
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Reads one envelope frame.
///
/// Returns `None` on a clean close (EOF before the length prefix). EOF
/// anywhere inside a frame is a protocol error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, ChannelError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len == 0 || len > MAX_HEADER_LEN {
        return Err(ChannelError::Protocol(format!(
            "invalid envelope length: {len} (max {MAX_HEADER_LEN})"
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ChannelError::Protocol("unexpected EOF inside envelope".into())
        } else {
            ChannelError::Io(e)
        }
    })?;

    Ok(Some(serde_json::from_slice(&buf)?))
}
