use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::trace;

use crate::network::PING;
use crate::protocol::{Message, Payload, MAX_PAYLOAD_SIZE};
use crate::{AppError, AppResult};

/// A TLV speaking TCP connection with an optional deadline.
///
/// While a deadline is set, every read and write that is still pending when
/// it passes fails with [`AppError::Timeout`]; later calls fail the same way
/// until the deadline is pushed forward or cleared. A deadline that expires
/// in the middle of a frame leaves the stream out of sync, so only resume
/// after timeouts between frames.
///
/// A peer running a liveness probe writes `ping` between frames; those
/// probes are skipped and counted by [`read_message`](Self::read_message).
#[derive(Debug)]
pub struct Connection {
    stream: BufStream<TcpStream>,
    peer: SocketAddr,
    max_payload_size: u32,
    deadline: Option<Instant>,
    probes_seen: u64,
}

impl Connection {
    pub fn new(socket: TcpStream) -> AppResult<Connection> {
        let peer = socket.peer_addr()?;
        Ok(Connection {
            stream: BufStream::new(socket),
            peer,
            max_payload_size: MAX_PAYLOAD_SIZE,
            deadline: None,
            probes_seen: 0,
        })
    }

    pub async fn connect(address: &str) -> AppResult<Connection> {
        let socket = TcpStream::connect(address).await?;
        Connection::new(socket)
    }

    pub fn with_max_payload_size(mut self, max_payload_size: u32) -> Self {
        self.max_payload_size = max_payload_size.min(MAX_PAYLOAD_SIZE);
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Liveness probes skipped so far.
    pub fn probes_seen(&self) -> u64 {
        self.probes_seen
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Shorthand for a deadline `timeout` from now.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Reads the next message, skipping liveness probes in front of it.
    /// `Ok(None)` means the peer closed the connection cleanly between two
    /// frames.
    pub async fn read_message(&mut self) -> AppResult<Option<Message>> {
        let max = self.max_payload_size;
        let deadline = self.deadline;
        let peer = self.peer;
        let stream = &mut self.stream;
        let probes_seen = &mut self.probes_seen;
        with_deadline(deadline, async move {
            loop {
                let buffered = stream.fill_buf().await?;
                if buffered.is_empty() {
                    return Ok(None);
                }
                if buffered[0] != PING[0] {
                    break;
                }
                let mut probe = [0u8; 4];
                stream.read_exact(&mut probe).await?;
                if &probe != PING {
                    return Err(AppError::UnknownType { actual: probe[0] });
                }
                *probes_seen += 1;
                trace!("skipped liveness probe from {}", peer);
            }
            let (message, read) = Message::read_limited(stream, max).await?;
            trace!("read {} bytes from {}", read, peer);
            Ok(Some(message))
        })
        .await
    }

    /// Writes and flushes one message, returning the bytes written.
    pub async fn write_message(&mut self, message: &Message) -> AppResult<u64> {
        let deadline = self.deadline;
        let stream = &mut self.stream;
        with_deadline(deadline, async move {
            let written = message.write_to(stream).await?;
            stream.flush().await?;
            Ok(written)
        })
        .await
    }

    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn with_deadline<T, F>(deadline: Option<Instant>, operation: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match deadline {
        Some(deadline) => time::timeout_at(deadline, operation)
            .await
            .map_err(|_| AppError::Timeout("connection deadline exceeded".into()))?,
        None => operation.await,
    }
}
