//! Per-connection state owned by the connection's task.
//!
//! # Responsibilities
//! - Hold the observed peer address stages may overwrite
//! - Collect bytes released past the end of the chain
//! - Carry the close flag and read-activity timestamp

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::BytesMut;

use super::{Inbound, Pipeline};
use crate::proxy::ProxyHeader;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Mutable facts about one connection, visible to every stage.
#[derive(Debug)]
pub struct ConnectionState {
    id: ConnectionId,
    /// Address of the socket peer as accepted
    transport_peer: SocketAddr,
    /// Address the rest of the system should treat as the client
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    proxy_header: Option<ProxyHeader>,
    released: BytesMut,
    closed: bool,
    /// PROXY detection reached a final outcome; never sniff again
    detection_settled: bool,
    last_read: Instant,
}

impl ConnectionState {
    pub fn new(peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            transport_peer: peer_addr,
            peer_addr,
            local_addr,
            proxy_header: None,
            released: BytesMut::new(),
            closed: false,
            detection_settled: false,
            last_read: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Currently recorded peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer_addr = addr;
    }

    /// Peer address of the underlying socket, never overwritten
    pub fn transport_peer_addr(&self) -> SocketAddr {
        self.transport_peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn proxy_header(&self) -> Option<&ProxyHeader> {
        self.proxy_header.as_ref()
    }

    pub fn set_proxy_header(&mut self, header: ProxyHeader) {
        self.proxy_header = Some(header);
    }

    /// Mark the connection for immediate teardown and drop pending output.
    pub fn close(&mut self) {
        self.closed = true;
        self.released.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn settle_detection(&mut self) {
        self.detection_settled = true;
    }

    /// Whether PROXY detection already decided this connection's fate.
    pub fn detection_settled(&self) -> bool {
        self.detection_settled
    }

    /// Append bytes that made it through the whole chain.
    pub fn release(&mut self, bytes: BytesMut) {
        if self.closed {
            return;
        }
        if self.released.is_empty() {
            self.released = bytes;
        } else {
            self.released.unsplit(bytes);
        }
    }

    /// Take every byte released so far.
    pub fn take_released(&mut self) -> BytesMut {
        self.released.split()
    }

    pub fn touch(&mut self) {
        self.last_read = Instant::now();
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }
}

/// A connection's chain together with its state.
///
/// Owned by exactly one task; nothing else mutates either half.
#[derive(Debug)]
pub struct Connection {
    pipeline: Pipeline,
    state: ConnectionState,
}

impl Connection {
    pub fn new(peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            pipeline: Pipeline::new(),
            state: ConnectionState::new(peer_addr, local_addr),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.state.id()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_closed()
    }

    /// Push freshly read bytes through the chain.
    pub fn read(&mut self, bytes: BytesMut) {
        self.fire(Inbound::Bytes(bytes));
    }

    /// Feed any message in at the head of the chain.
    pub fn fire(&mut self, msg: Inbound) {
        self.pipeline.fire_read(&mut self.state, msg);
    }

    pub fn take_released(&mut self) -> BytesMut {
        self.state.take_released()
    }
}
