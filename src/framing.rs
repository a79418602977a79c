//! Length-delimited framed I/O over an async byte stream.
//!
//! The wire format is `varint(len) || postcard(frame)`, mirroring
//! `rapace-core`'s stream transport varint-prefixed records (clean-EOF vs
//! truncated-EOF distinction, a hard cap on varint length) generalized from
//! a fixed 64-byte descriptor to an arbitrary postcard-encoded `Frame`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{LimitExceeded, LimitField, ProtocolError};
use crate::frame::Frame;
use crate::limits::Limits;

/// Maximum varint length in bytes (10 bytes covers a full u64).
const MAX_VARINT_LEN: usize = 10;

enum VarintResult {
    Value(u64),
    CleanEof,
    TruncatedVarint,
    TooLong,
}

async fn read_varint<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<VarintResult, std::io::Error> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    for bytes_read in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(if bytes_read == 0 {
                    VarintResult::CleanEof
                } else {
                    VarintResult::TruncatedVarint
                });
            }
            Err(e) => return Err(e),
        }

        value |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(VarintResult::Value(value));
        }
        shift += 7;
    }

    Ok(VarintResult::TooLong)
}

fn encode_varint(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf[i] = byte;
            return i + 1;
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
}

/// Reads length-delimited frames off an `AsyncRead`.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next frame, enforcing `limits.max_frame` on the whole
    /// record and `limits.max_chunk` on a CHUNK's payload.
    ///
    /// Returns `Ok(None)` on clean close at a frame boundary (the
    /// end-of-stream sentinel) — this is not an error.
    pub async fn read_frame(&mut self, limits: &Limits) -> Result<Option<Frame>, ProtocolError> {
        let frame_len = match read_varint(&mut self.inner).await? {
            VarintResult::Value(v) => v,
            VarintResult::CleanEof => return Ok(None),
            VarintResult::TruncatedVarint => return Err(ProtocolError::TruncatedVarint),
            VarintResult::TooLong => return Err(ProtocolError::VarintTooLong),
        };

        if frame_len > limits.max_frame as u64 {
            return Err(ProtocolError::LimitExceeded(LimitExceeded {
                field: LimitField::Frame,
                len: frame_len as usize,
                max: limits.max_frame as usize,
            }));
        }

        let mut buf = vec![0u8; frame_len as usize];
        self.inner.read_exact(&mut buf).await?;

        let frame: Frame = postcard::from_bytes(&buf)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;

        if let Frame::Chunk { payload, .. } = &frame {
            if payload.len() > limits.max_chunk as usize {
                return Err(ProtocolError::LimitExceeded(LimitExceeded {
                    field: LimitField::Chunk,
                    len: payload.len(),
                    max: limits.max_chunk as usize,
                }));
            }
        }

        Ok(Some(frame))
    }
}

/// Writes length-delimited frames to an `AsyncWrite`. Writes a whole frame
/// or errors; no partial frame is ever observable by a reader.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let encoded =
            postcard::to_allocvec(frame).map_err(|e| ProtocolError::Decode(e.to_string()))?;

        let mut varint_buf = [0u8; MAX_VARINT_LEN];
        let varint_len = encode_varint(encoded.len() as u64, &mut varint_buf);

        self.inner.write_all(&varint_buf[..varint_len]).await?;
        self.inner.write_all(&encoded).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
