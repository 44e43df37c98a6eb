//! Length-prefixed JSON framing for the tether control stream.
//!
//! Wire format: `[4-byte big-endian length][UTF-8 JSON payload]`

use crate::envelope::Envelope;
use crate::error::{TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum frame size (10 MiB). Frames above this are treated as a
/// transport-level fault, not a skippable bad message.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Encode an envelope into a length-prefixed JSON frame.
pub fn frame_encode(envelope: &Envelope) -> TetherResult<Vec<u8>> {
    let payload = serde_json::to_vec(envelope)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(TetherError::Codec(format!(
            "outgoing frame too large: {} bytes",
            payload.len()
        )));
    }
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a JSON payload (without length prefix) into an envelope.
pub fn frame_decode(data: &[u8]) -> TetherResult<Envelope> {
    Ok(serde_json::from_slice(data)?)
}

/// Read one raw frame body from the stream.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary. An oversized
/// length header yields `TetherError::Transport` — the caller must tear
/// the channel down rather than resynchronize.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> TetherResult<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TetherError::Transport(e.to_string())),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TetherError::Transport(format!(
            "incoming frame too large: {len} bytes"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| TetherError::Transport(e.to_string()))?;
    Ok(Some(body))
}
