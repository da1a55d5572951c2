//! TCP Front-end
//!
//! Accepts clients, builds each connection's chain through the active
//! [`ChainInitializer`], and relays released bytes to the upstream server.
//!
//! # Responsibilities
//! - Bind the listener and cap concurrent connections
//! - Run one task per connection that owns its chain exclusively
//! - Keep a registry so setup actions can be marshalled onto live connections

mod registry;
mod session;

pub use registry::{ConnectionHandle, ConnectionRegistry, ConnectionTask};
pub use session::CloseReason;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::gateway::{ChainInitializer, ConnectionGateway, DetectorInitializer};
use crate::pipeline::Connection;
use crate::whitelist::WhitelistError;
use session::Session;

const LISTEN_BACKLOG: i32 = 1024;
/// Pause after a failed accept so persistent errors (EMFILE) do not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors from the front-end lifecycle
#[derive(Debug)]
pub enum ServerError {
    /// Failed to bind the listener
    Bind(io::Error),
    /// Failed to accept a connection
    Accept(io::Error),
    /// Configuration could not be loaded or is invalid
    Config(ConfigError),
    /// Whitelist could not be loaded
    Whitelist(WhitelistError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "failed to bind: {}", e),
            ServerError::Accept(e) => write!(f, "failed to accept: {}", e),
            ServerError::Config(e) => write!(f, "{}", e),
            ServerError::Whitelist(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(e) | ServerError::Accept(e) => Some(e),
            ServerError::Config(e) => Some(e),
            ServerError::Whitelist(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

impl From<WhitelistError> for ServerError {
    fn from(e: WhitelistError) -> Self {
        ServerError::Whitelist(e)
    }
}

struct Shared {
    upstream: String,
    idle_timeout: Option<Duration>,
    initializer: RwLock<Arc<dyn ChainInitializer>>,
    registry: ConnectionRegistry,
}

/// The front-end listener.
pub struct Server {
    listener: TcpListener,
    connection_limit: Arc<Semaphore>,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind the configured address. Must be called within a tokio runtime.
    pub async fn bind(
        config: &ServerConfig,
        initializer: Arc<dyn ChainInitializer>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .bind
            .parse()
            .map_err(|e| ServerError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ServerError::Bind)?;
        socket.set_reuse_address(true).map_err(ServerError::Bind)?;
        socket.set_nonblocking(true).map_err(ServerError::Bind)?;
        socket.bind(&addr.into()).map_err(ServerError::Bind)?;
        socket.listen(LISTEN_BACKLOG).map_err(ServerError::Bind)?;
        let listener = TcpListener::from_std(socket.into()).map_err(ServerError::Bind)?;

        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        info!(
            address = %local_addr,
            upstream = %config.upstream,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            listener,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            shared: Arc::new(Shared {
                upstream: config.upstream.clone(),
                idle_timeout: config.idle_timeout_duration(),
                initializer: RwLock::new(initializer),
                registry: ConnectionRegistry::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn active_connections(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    /// Wrap the active initializer with a detector and install one on every
    /// live connection. Returns how many live connections were scheduled.
    pub fn enable_detector(&self, gateway: &ConnectionGateway) -> usize {
        {
            let mut active = self.shared.initializer.write();
            let wrapped = DetectorInitializer::new(active.clone(), gateway.clone());
            *active = Arc::new(wrapped);
        }
        let scheduled = self.shared.registry.install_all(gateway);
        info!(live_connections = scheduled, "PROXY detector enabled");
        scheduled
    }

    async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        self.listener.accept().await.map_err(ServerError::Accept)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServerError> {
        // Sessions listen on their own receivers
        let (session_shutdown, _) = broadcast::channel::<()>(1);

        loop {
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        drop(permit);
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => continue,
                        }
                    }
                },
            };

            debug!(
                peer_addr = %peer_addr,
                available_permits = self.connection_limit.available_permits(),
                "Connection accepted"
            );

            let shared = self.shared.clone();
            let shutdown_rx = session_shutdown.subscribe();
            tokio::spawn(async move {
                serve(shared, stream, peer_addr, shutdown_rx).await;
                drop(permit);
            });
        }

        info!("Listener stopped, closing connections");
        let _ = session_shutdown.send(());
        Ok(())
    }
}

async fn serve(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown: broadcast::Receiver<()>,
) {
    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!(peer_addr = %peer_addr, error = %e, "Connection dropped before setup");
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let mut conn = Connection::new(peer_addr, local_addr);
    let id = conn.id();

    // Register before reading the initializer so a concurrent enable_detector
    // reaches this connection one way or the other
    let (handle, tasks) = ConnectionHandle::new(id);
    shared.registry.register(handle);
    let initializer = shared.initializer.read().clone();

    if let Err(e) = initializer.init_chain(&mut conn) {
        error!(connection_id = %id, peer_addr = %peer_addr, error = %e, "Failed to build chain");
        shared.registry.unregister(id);
        return;
    }
    debug!(connection_id = %id, chain = ?conn.pipeline(), "Chain initialised");

    let session = Session::new(
        conn,
        stream,
        shared.upstream.clone(),
        tasks,
        shared.idle_timeout,
    );
    if let Err(e) = session.run(shutdown).await {
        debug!(connection_id = %id, error = %e, "Connection ended with error");
    }

    shared.registry.unregister(id);
    initializer.connection_closed(id);
}
