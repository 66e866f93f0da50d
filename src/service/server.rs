use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::network::{channel_writer, ChannelWriter, LivenessProbe};
use crate::protocol::Message;
use crate::utils::TaskGroup;
use crate::{AppError, AppResult};

use super::{CancelScope, WireConfig};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames queued for the socket writer of one connection.
const WRITE_QUEUE_CAPACITY: usize = 32;

/// TLV echo server. Every accepted connection gets a liveness probe and has
/// each decoded message written back to it.
pub struct Server {
    listener: TcpListener,
    scope: CancelScope,
    config: Arc<WireConfig>,
}

impl Server {
    pub fn new(listener: TcpListener, scope: CancelScope, config: Arc<WireConfig>) -> Self {
        Server {
            listener,
            scope,
            config,
        }
    }

    pub async fn bind(scope: CancelScope, config: Arc<WireConfig>) -> AppResult<Self> {
        let listen_address = config.listen_address();
        let listener = TcpListener::bind(&listen_address).await.map_err(|e| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, e
            );
            error!("{}", error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        info!("tcp server binding to {} for listening", &listen_address);
        Ok(Server::new(listener, scope, config))
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until the scope ends, then waits for every connection handler.
    pub async fn run(&self) -> AppResult<()> {
        let mut connections = TaskGroup::new("connections");
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.scope.cancelled() => {
                    debug!("server exit accept loop after scope ended");
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                    debug!("accepted connection {} from {}", connection_id, peer);
                    let handler = ConnectionHandler {
                        connection_id,
                        peer,
                        scope: self.scope.child(),
                        config: self.config.clone(),
                    };
                    connections.reap();
                    connections.spawn(async move {
                        if let Err(e) = handler.handle_connection(socket).await {
                            warn!(
                                "connection {} from {} closed with error: {}",
                                handler.connection_id, handler.peer, e
                            );
                        }
                    });
                }
                Err(e) => {
                    // usually a transient resource shortage, back off a little
                    error!("accept error: {}", e);
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        let finished = connections.join_all().await;
        info!("server stopped, {} connection handlers finished", finished);
        Ok(())
    }
}

// handler for each connection
struct ConnectionHandler {
    connection_id: u64,
    peer: SocketAddr,
    scope: CancelScope,
    config: Arc<WireConfig>,
}

impl ConnectionHandler {
    async fn handle_connection(&self, socket: TcpStream) -> AppResult<()> {
        let (read_half, write_half) = socket.into_split();
        let (writer, frames_rx) = channel_writer(WRITE_QUEUE_CAPACITY);
        let (reset_tx, reset_rx) = mpsc::channel(1);

        let mut tasks = TaskGroup::new(format!("connection-{}", self.connection_id));
        let scope = self.scope.clone();
        tasks.spawn(async move {
            if let Err(e) = drain_frames(&scope, frames_rx, write_half).await {
                debug!("socket writer stopped: {}", e);
                scope.cancel();
            }
        });

        // ends with the connection, or alone once the echo loop is done
        let probe_scope = self.scope.child();
        let probe = LivenessProbe::new(probe_scope.clone(), writer.clone(), reset_rx)
            .with_default_interval(self.config.probe_interval());
        let connection_id = self.connection_id;
        tasks.spawn(async move {
            match probe.run().await {
                Ok(sent) => trace!("connection {} probe sent {} pings", connection_id, sent),
                Err(e) => debug!("connection {} probe stopped: {}", connection_id, e),
            }
        });

        let result = self.echo(read_half, writer, reset_tx).await;
        // with the probe gone the writer task flushes what is queued and
        // closes the write half, unless the connection scope ends first
        probe_scope.cancel();
        tasks.join_all().await;
        debug!("connection {} from {} closed", self.connection_id, self.peer);
        result
    }

    async fn echo(
        &self,
        read_half: OwnedReadHalf,
        mut writer: ChannelWriter,
        reset_tx: mpsc::Sender<Duration>,
    ) -> AppResult<()> {
        let mut reader = BufReader::new(read_half);
        let max = self.config.codec.max_payload_size;
        let idle_timeout = self.config.idle_timeout();
        loop {
            let read = async {
                match idle_timeout {
                    Some(limit) => time::timeout(limit, Message::read_limited(&mut reader, max))
                        .await
                        .map_err(|_| AppError::Timeout(format!("idle for {:?}", limit)))?,
                    None => Message::read_limited(&mut reader, max).await,
                }
            };
            let result = tokio::select! {
                biased;
                _ = self.scope.cancelled() => return Ok(()),
                result = read => result,
            };
            let message = match result {
                Ok((message, consumed)) => {
                    trace!("connection {} read {} bytes", self.connection_id, consumed);
                    message
                }
                Err(e) if e.is_eof_between_frames() => return Ok(()),
                Err(AppError::Timeout(reason)) => {
                    info!("closing connection {}: {}", self.connection_id, reason);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if !restart_probe_window(&reset_tx) {
                trace!("connection {} probe is gone, reset dropped", self.connection_id);
            }
            let frame = message.to_frame().await?;
            tokio::select! {
                biased;
                _ = self.scope.cancelled() => return Ok(()),
                written = writer.write_all(&frame) => written?,
            }
        }
    }
}

/// Keeps the probe interval and restarts its window. A reset already queued
/// does the same, so a full slot counts as delivered. False once the probe
/// has stopped.
fn restart_probe_window(reset_tx: &mpsc::Sender<Duration>) -> bool {
    match reset_tx.try_send(Duration::ZERO) {
        Ok(()) | Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Owns the socket write half. Returns once every sender is gone and the
/// queue is flushed, or as soon as the scope ends, even in the middle of a
/// write to a peer that stopped reading.
async fn drain_frames(
    scope: &CancelScope,
    mut frames_rx: mpsc::Receiver<bytes::Bytes>,
    mut write_half: OwnedWriteHalf,
) -> AppResult<()> {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            chunk = frames_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            written = write_half.write_all(&chunk) => written?,
        }
    }
    write_half.shutdown().await?;
    Ok(())
}
