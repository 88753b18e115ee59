//! Length-prefixed CBOR framing for the control channel.
//!
//! Wire format: `[4-byte big-endian length][CBOR frame]`. The length
//! covers only the CBOR body. TCP offers no message boundaries, so the
//! decoder buffers partial frames and yields complete ones as they arrive.

use crate::error::{TunnelError, TunnelResult};
use crate::frame::Frame;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body. A longer announced length is a protocol
/// error, fatal to the control channel.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encode a frame into a length-prefixed CBOR envelope.
pub fn frame_encode(frame: &Frame) -> TunnelResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(frame, &mut body)?;

    let len = body.len() as u32;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend(body);
    Ok(out)
}

/// Decode a CBOR body (without length prefix) into a frame.
fn decode_body(data: &[u8]) -> TunnelResult<Frame> {
    let frame: Frame = ciborium::from_reader(Cursor::new(data))?;
    Ok(frame)
}

/// Streaming frame decoder: accumulates bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete frames.
    pub fn feed(&mut self, data: &[u8]) -> TunnelResult<Vec<Frame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;
            if len > MAX_FRAME_LEN {
                return Err(TunnelError::Protocol(format!(
                    "frame length {len} exceeds {MAX_FRAME_LEN}"
                )));
            }

            if self.buffer.len() < 4 + len {
                break;
            }

            frames.push(decode_body(&self.buffer[4..4 + len])?);
            self.buffer.drain(..4 + len);
        }

        Ok(frames)
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Read one frame from an async stream.
///
/// Returns [`TunnelError::Eof`] when the peer closed cleanly at a frame
/// boundary; a close mid-frame is a protocol error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> TunnelResult<Frame> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                TunnelError::Eof
            } else {
                TunnelError::Protocol("connection closed mid-header".into())
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TunnelError::Protocol(format!(
            "frame length {len} exceeds {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TunnelError::Protocol("connection closed mid-frame".into())
        } else {
            TunnelError::Io(e)
        }
    })?;

    decode_body(&body)
}

/// Write one frame to an async stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> TunnelResult<()> {
    let bytes = frame_encode(frame)?;
    writer.write_all(&bytes).await?;
    Ok(())
}
