use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// An `AsyncWrite` that forwards every write as one chunk over a bounded
/// channel.
///
/// Several producers can share a socket this way: each clone sends whole
/// chunks, and the single task draining the receiver is the only one that
/// touches the socket. A chunk is never split, so a caller that writes a
/// complete frame in one `write` call keeps it contiguous on the wire.
/// Once the receiver is gone every write fails with `BrokenPipe`.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: PollSender<Bytes>,
}

pub fn channel_writer(capacity: usize) -> (ChannelWriter, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChannelWriter {
            tx: PollSender::new(tx),
        },
        rx,
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "writer task is gone")
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        if ready!(this.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(broken_pipe()));
        }
        this.tx
            .send_item(Bytes::copy_from_slice(buf))
            .map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().tx.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn test_chunks_arrive_whole_and_in_order() -> io::Result<()> {
        let (mut writer, mut rx) = channel_writer(4);
        let mut other = writer.clone();

        writer.write_all(b"first frame").await?;
        other.write_all(b"ping").await?;
        writer.write_all(b"second").await?;

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"first frame"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"ping"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"second"));
        Ok(())
    }

    #[tokio::test]
    async fn test_write_fails_after_receiver_dropped() {
        let (mut writer, rx) = channel_writer(1);
        drop(rx);
        let err = writer.write_all(b"ping").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
