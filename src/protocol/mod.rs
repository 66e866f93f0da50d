//! Type-length-value framing.
//!
//! Every message on the wire is a 5 byte header followed by the value:
//!
//! ```text
//! offset 0 : type tag     (u8)
//! offset 1 : value length (u32, big-endian)
//! offset 5 : value        (length bytes)
//! ```
//!
//! Each payload variant implements [`Payload`]. Encoding and decoding report
//! exactly how many bytes crossed the sink or source, on success through the
//! returned count and on failure through [`AppError::transferred`].
//!
//! [`AppError::transferred`]: crate::AppError::transferred

use std::fmt::Display;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::service::FrameField;
use crate::{AppError, AppResult};

pub use binary::Binary;
pub use message::Message;
pub use text::Text;

mod binary;
mod message;
mod text;

pub const BINARY_TYPE: u8 = 1;
pub const TEXT_TYPE: u8 = 2;
/// 10 MiB. A peer announcing more than this is refused before any buffer is
/// allocated for the value.
pub const MAX_PAYLOAD_SIZE: u32 = 10 << 20;
pub const HEADER_SIZE: usize = 5;

#[allow(async_fn_in_trait)]
pub trait Payload: Display {
    /// The raw value, without the header.
    fn bytes(&self) -> &[u8];

    /// Replaces the value with one decoded from `reader`, returning the number
    /// of bytes consumed.
    async fn read_from<R>(&mut self, reader: &mut R) -> AppResult<u64>
    where
        R: AsyncRead + Unpin + Send;

    /// Writes header and value to `writer`, returning the number of bytes
    /// accepted by it. The writer is not flushed.
    async fn write_to<W>(&self, writer: &mut W) -> AppResult<u64>
    where
        W: AsyncWrite + Unpin + Send;
}

pub(crate) async fn write_frame<W>(writer: &mut W, tag: u8, value: &[u8]) -> AppResult<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let length = u32::try_from(value.len()).map_err(|_| {
        AppError::InvalidValue(format!("value of {} bytes can not be framed", value.len()))
    })?;

    let written = write_counted(writer, &[tag], FrameField::Type, 0).await?;
    let written = write_counted(writer, &length.to_be_bytes(), FrameField::Length, written).await?;
    write_counted(writer, value, FrameField::Value, written).await
}

/// Writes `buf` one `write` at a time so a failing sink still reports exactly
/// what it took. `before` is the count of bytes already written for the frame.
async fn write_counted<W>(writer: &mut W, buf: &[u8], field: FrameField, before: u64) -> AppResult<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut sent = 0;
    while sent < buf.len() {
        match writer.write(&buf[sent..]).await {
            Ok(0) => {
                return Err(AppError::io(
                    field,
                    before + sent as u64,
                    std::io::ErrorKind::WriteZero.into(),
                ))
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AppError::io(field, before + sent as u64, e)),
        }
    }
    Ok(before + sent as u64)
}

pub(crate) async fn read_tag<R>(reader: &mut R) -> AppResult<u8>
where
    R: AsyncRead + Unpin + Send,
{
    reader
        .read_u8()
        .await
        .map_err(|e| AppError::io(FrameField::Type, 0, e))
}

/// Reads the length field that follows an already consumed tag and checks it
/// against `max`.
pub(crate) async fn read_length<R>(reader: &mut R, max: u32) -> AppResult<u32>
where
    R: AsyncRead + Unpin + Send,
{
    let length = reader
        .read_u32()
        .await
        .map_err(|e| AppError::io(FrameField::Length, 1, e))?;
    if length > max {
        return Err(AppError::ExceedsMaxPayload { length, max });
    }
    Ok(length)
}

/// Fills a buffer of exactly `length` bytes. Short reads are retried until the
/// buffer is full, the source ends or it fails.
pub(crate) async fn read_value<R>(reader: &mut R, length: u32) -> AppResult<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut value = vec![0u8; length as usize];
    let mut filled = 0;
    while filled < value.len() {
        match reader.read(&mut value[filled..]).await {
            Ok(0) => {
                return Err(AppError::io(
                    FrameField::Value,
                    (HEADER_SIZE + filled) as u64,
                    std::io::ErrorKind::UnexpectedEof.into(),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(AppError::io(
                    FrameField::Value,
                    (HEADER_SIZE + filled) as u64,
                    e,
                ))
            }
        }
    }
    Ok(value)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::AsyncWrite;

    /// Accepts at most `capacity` bytes, then fails every write.
    #[derive(Debug, Default)]
    pub struct LimitedSink {
        pub accepted: Vec<u8>,
        pub capacity: usize,
    }

    impl LimitedSink {
        pub fn new(capacity: usize) -> Self {
            LimitedSink {
                accepted: Vec::new(),
                capacity,
            }
        }
    }

    impl AsyncWrite for LimitedSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let room = self.capacity - self.accepted.len();
            if room == 0 {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let n = room.min(buf.len());
            self.accepted.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}
