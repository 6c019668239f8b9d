//! Stream framing for substrate connections
//!
//! Each message is `[kind: u8][len: u32 BE][payload]` with kind 1 for text
//! and 2 for binary. A connection starts with both sides writing their
//! 32-byte identity.

use bytes::Bytes;
use swarmcast_core::{PeerIdentity, WireMessage, KEY_LEN};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const KIND_TEXT: u8 = 1;
const KIND_BINARY: u8 = 2;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("text frame is not valid UTF-8")]
    InvalidUtf8,
}

pub async fn write_message(
    stream: &mut (impl AsyncWrite + Unpin),
    message: &WireMessage,
) -> Result<(), WireError> {
    let (kind, payload): (u8, &[u8]) = match message {
        WireMessage::Text(text) => (KIND_TEXT, text.as_bytes()),
        WireMessage::Binary(bytes) => (KIND_BINARY, bytes.as_ref()),
    };
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(payload.len()));
    }
    let mut header = [0u8; 5];
    header[0] = kind;
    header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    trace!("Sent kind {} ({} bytes)", kind, payload.len());
    Ok(())
}

/// Read one message; `Ok(None)` on a clean end of stream between frames
pub async fn read_message(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<Option<WireMessage>, WireError> {
    let mut header = [0u8; 5];
    match stream.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    stream.read_exact(&mut header[1..]).await?;

    let kind = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    trace!("Received kind {} ({} bytes)", kind, len);

    match kind {
        KIND_TEXT => String::from_utf8(payload)
            .map(|text| Some(WireMessage::Text(text)))
            .map_err(|_| WireError::InvalidUtf8),
        KIND_BINARY => Ok(Some(WireMessage::Binary(Bytes::from(payload)))),
        other => Err(WireError::UnknownKind(other)),
    }
}

/// Exchange identities; returns the remote one
pub async fn handshake<S>(stream: &mut S, local: PeerIdentity) -> Result<PeerIdentity, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(local.as_bytes()).await?;
    stream.flush().await?;
    let mut remote = [0u8; KEY_LEN];
    stream.read_exact(&mut remote).await?;
    Ok(PeerIdentity::from_bytes(remote))
}
