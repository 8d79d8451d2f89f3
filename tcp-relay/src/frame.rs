//! Length-prefixed framing for relay messages.
//!
//! Every message on the wire is a frame: a 4-byte big-endian length followed
//! by that many payload bytes. The relay never looks inside the payload.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload accepted unless configured otherwise (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("connection closed in the middle of a frame")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of trying to pull one frame off the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame { payload: Bytes, consumed: usize },
    NeedMoreData,
}

/// Encodes `payload` as a single frame.
pub fn encode(payload: &[u8], max_len: usize) -> Result<Bytes, FrameError> {
    check_len(payload.len(), max_len)?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Decodes the first frame in `buf` without consuming it.
///
/// A short buffer is not an error: the caller should read more bytes and try
/// again. A declared length over `max_len` is, and leaves the stream
/// unrecoverable since the frame boundary can no longer be trusted.
pub fn decode(buf: &[u8], max_len: usize) -> Result<Decoded, FrameError> {
    Ok(match complete_frame_len(buf, max_len)? {
        Some(consumed) => Decoded::Frame {
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..consumed]),
            consumed,
        },
        None => Decoded::NeedMoreData,
    })
}

/// Splits the first complete frame off `buf`, leaving any trailing bytes.
pub fn decode_from(buf: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>, FrameError> {
    let Some(consumed) = complete_frame_len(&buf[..], max_len)? else {
        return Ok(None);
    };
    let mut frame = buf.split_to(consumed);
    frame.advance(HEADER_LEN);
    Ok(Some(frame.freeze()))
}

/// Total length of the first frame in `buf`, if all of it is there.
fn complete_frame_len(buf: &[u8], max_len: usize) -> Result<Option<usize>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut header = &buf[..HEADER_LEN];
    let len = header.get_u32() as usize;
    check_len(len, max_len)?;

    let consumed = HEADER_LEN + len;
    Ok((buf.len() >= consumed).then_some(consumed))
}

/// Reads one frame, returning `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let read = reader.read(&mut header[filled..]).await?;
        if read == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }
        filled += read;
    }

    let len = u32::from_be_bytes(header) as usize;
    check_len(len, max_len)?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => FrameError::Truncated,
            _ => FrameError::Io(err),
        })?;
    Ok(Some(Bytes::from(payload)))
}

/// Writes one frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(payload, max_len)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn check_len(len: usize, max_len: usize) -> Result<(), FrameError> {
    let max = max_len.min(u32::MAX as usize);
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    Ok(())
}
