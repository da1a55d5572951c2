//! Live connection registry.
//!
//! Every connection task owns its chain. Code outside that task reaches a
//! connection only by scheduling a closure on its [`ConnectionHandle`].

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::gateway::{install_detector, ConnectionGateway};
use crate::pipeline::{Connection, ConnectionId};

/// Work run on a connection's own task with exclusive access to it
pub type ConnectionTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Sending side of a connection's execution context.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ConnectionTask>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its connection task must drain.
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<ConnectionTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Schedule `task` on the connection's task.
    ///
    /// Returns `false` if the connection task has already exited.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut Connection) + Send + 'static,
    {
        self.tx.send(Box::new(task)).is_ok()
    }
}

/// All connections currently served by the front-end.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle, ahash::RandomState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.connections.insert(handle.id(), handle);
    }

    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Schedule detector installation on every live connection.
    ///
    /// Returns how many connections accepted the task.
    pub fn install_all(&self, gateway: &ConnectionGateway) -> usize {
        let mut scheduled = 0;
        for entry in self.connections.iter() {
            let gateway = gateway.clone();
            let accepted = entry.value().execute(move |conn| {
                match install_detector(conn, &gateway) {
                    Ok(true) => debug!(connection_id = %conn.id(), "Detector installed on live connection"),
                    Ok(false) => {}
                    Err(e) => warn!(
                        connection_id = %conn.id(),
                        error = %e,
                        "Failed to install detector on live connection"
                    ),
                }
            });
            if accepted {
                scheduled += 1;
            }
        }
        debug!(scheduled, "Scheduled detector installation");
        scheduled
    }
}
