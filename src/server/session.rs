//! Per-connection task: socket reads into the pipeline, released bytes out to
//! the upstream, and upstream replies back to the client.

use std::future;
use std::io;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::registry::ConnectionTask;
use crate::pipeline::Connection;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    UpstreamClosed,
    IdleTimeout,
    /// The pipeline asked for an immediate close
    Pipeline,
    Shutdown,
}

pub(crate) struct Session {
    conn: Connection,
    client: TcpStream,
    upstream_addr: String,
    upstream: Option<TcpStream>,
    tasks: mpsc::UnboundedReceiver<ConnectionTask>,
    idle_timeout: Option<Duration>,
}

impl Session {
    pub(crate) fn new(
        conn: Connection,
        client: TcpStream,
        upstream_addr: String,
        tasks: mpsc::UnboundedReceiver<ConnectionTask>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            conn,
            client,
            upstream_addr,
            upstream: None,
            tasks,
            idle_timeout,
        }
    }

    /// Drive the connection until either side closes or the pipeline drops it.
    pub(crate) async fn run(
        mut self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> io::Result<CloseReason> {
        let mut client_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut upstream_buf = vec![0u8; READ_BUFFER_SIZE];

        let reason = loop {
            client_buf.reserve(READ_BUFFER_SIZE);
            let deadline = self
                .idle_timeout
                .map(|timeout| self.conn.state().last_read() + timeout);

            // Scheduled tasks run before reads that arrive after them
            tokio::select! {
                biased;

                Some(task) = self.tasks.recv() => {
                    task(&mut self.conn);
                }
                read = self.client.read_buf(&mut client_buf) => {
                    if read? == 0 {
                        break CloseReason::ClientClosed;
                    }
                    trace!(connection_id = %self.conn.id(), bytes = client_buf.len(), "Client read");
                    self.conn.read(client_buf.split());
                }
                read = read_upstream(&mut self.upstream, &mut upstream_buf) => {
                    let n = read?;
                    if n == 0 {
                        break CloseReason::UpstreamClosed;
                    }
                    self.client.write_all(&upstream_buf[..n]).await?;
                }
                _ = idle(deadline) => {
                    break CloseReason::IdleTimeout;
                }
                _ = shutdown.recv() => {
                    break CloseReason::Shutdown;
                }
            }

            if !self.conn.is_open() {
                break CloseReason::Pipeline;
            }
            self.relay_released().await?;
        };

        if reason == CloseReason::Pipeline {
            // Reset instead of a graceful FIN
            if let Err(e) = SockRef::from(&self.client).set_linger(Some(Duration::ZERO)) {
                debug!(connection_id = %self.conn.id(), error = %e, "Failed to set SO_LINGER");
            }
        } else if let Some(upstream) = self.upstream.as_mut() {
            let _ = upstream.shutdown().await;
        }

        info!(
            connection_id = %self.conn.id(),
            peer_addr = %self.conn.state().peer_addr(),
            transport_addr = %self.conn.state().transport_peer_addr(),
            reason = ?reason,
            "Connection closed"
        );
        Ok(reason)
    }

    async fn relay_released(&mut self) -> io::Result<()> {
        let released = self.conn.take_released();
        if released.is_empty() {
            return Ok(());
        }

        if self.upstream.is_none() {
            let stream = TcpStream::connect(&self.upstream_addr).await.map_err(|e| {
                warn!(
                    connection_id = %self.conn.id(),
                    upstream = %self.upstream_addr,
                    error = %e,
                    "Failed to connect upstream"
                );
                e
            })?;
            stream.set_nodelay(true)?;
            debug!(
                connection_id = %self.conn.id(),
                peer_addr = %self.conn.state().peer_addr(),
                upstream = %self.upstream_addr,
                "Upstream connected"
            );
            self.upstream = Some(stream);
        }

        if let Some(upstream) = self.upstream.as_mut() {
            upstream.write_all(&released).await?;
        }
        Ok(())
    }
}

async fn read_upstream(upstream: &mut Option<TcpStream>, buf: &mut [u8]) -> io::Result<usize> {
    match upstream {
        Some(stream) => stream.read(buf).await,
        None => future::pending().await,
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => future::pending().await,
    }
}
