use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, ServerConfig};
use crate::crypto::PayloadCipher;
use crate::events::{EventHandler, NoopEvents};
use crate::tcp::{BoxedTransport, Connection, Registry};
use crate::tls;
use crate::transfer::FolderSummary;
use crate::types::{ConnectionId, Envelope, Result, TetherError};

/// Upper bound for a TLS handshake on an accepted socket
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerBuilder {
    config: ServerConfig,
    events: Option<Arc<dyn EventHandler>>,
    cipher: Option<Arc<dyn PayloadCipher>>,
}

impl ServerBuilder {
    pub fn handler(mut self, events: impl EventHandler) -> Self {
        self.events = Some(Arc::new(events));
        self
    }

    /// Override the cipher derived from the configured passphrase
    pub fn cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Bind the listening socket
    pub async fn bind(self) -> Result<Server> {
        self.config.validate()?;
        let acceptor = match &self.config.tls {
            Some(tls_config) => Some(tls::server_acceptor(tls_config)?),
            None => None,
        };

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Tether server bound to {} (tls={})",
            local_addr,
            acceptor.is_some()
        );

        let cipher = self.cipher.or_else(|| self.config.connection.cipher());
        Ok(Server {
            listener,
            acceptor,
            handle: ServerHandle {
                inner: Arc::new(ServerInner {
                    local_addr,
                    registry: Registry::new(),
                    next_id: AtomicU64::new(1),
                    connection_config: Arc::new(self.config.connection),
                    cipher,
                    events: self
                        .events
                        .unwrap_or_else(|| Arc::new(NoopEvents) as Arc<dyn EventHandler>),
                    shutdown: CancellationToken::new(),
                }),
            },
        })
    }
}

struct ServerInner {
    local_addr: SocketAddr,
    registry: Registry,
    /// Ids are handed out once and never reused
    next_id: AtomicU64,
    connection_config: Arc<ConnectionConfig>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    events: Arc<dyn EventHandler>,
    shutdown: CancellationToken,
}

/// Multi-client tether server
pub struct Server {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handle: ServerHandle,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            events: None,
            cipher: None,
        }
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.inner.local_addr
    }

    /// Handle for sending to and managing connections while the server runs
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept connections until [`ServerHandle::shutdown`] is called
    pub async fn run(self) -> Result<()> {
        let inner = self.handle.inner.clone();
        info!("Tether server starting on {}", inner.local_addr);
        inner.events.on_server_started();

        loop {
            let (socket, addr) = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let id = ConnectionId(inner.next_id.fetch_add(1, Ordering::SeqCst));
            info!("New connection {} from {}", id, addr);
            tokio::spawn(serve_connection(
                inner.clone(),
                self.acceptor.clone(),
                socket,
                addr,
                id,
            ));
        }

        drop(self.listener);
        for conn in inner.registry.drain().await {
            conn.close();
            conn.closed().await;
        }
        info!("Tether server on {} stopped", inner.local_addr);
        Ok(())
    }
}

async fn serve_connection(
    inner: Arc<ServerInner>,
    acceptor: Option<TlsAcceptor>,
    socket: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("Connection {}: set_nodelay failed: {}", id, e);
    }

    let transport: BoxedTransport = match acceptor {
        Some(acceptor) => {
            let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket));
            let accepted = tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                accepted = handshake => accepted,
            };
            match accepted {
                Ok(Ok(stream)) => Box::new(stream),
                Ok(Err(e)) => {
                    warn!("Connection {}: TLS handshake with {} failed: {}", id, addr, e);
                    return;
                }
                Err(_) => {
                    warn!("Connection {}: TLS handshake with {} timed out", id, addr);
                    return;
                }
            }
        }
        None => Box::new(socket),
    };

    let conn = Connection::new(
        id,
        transport,
        Some(addr),
        inner.connection_config.clone(),
        inner.cipher.clone(),
        inner.events.clone(),
    );
    // Registered and announced before anything is read from the peer
    inner.registry.insert(conn.clone()).await;
    inner.events.on_connected(id);
    conn.start();

    tokio::select! {
        _ = conn.closed() => {}
        _ = inner.shutdown.cancelled() => {
            conn.close();
            conn.closed().await;
        }
    }

    inner.registry.remove(id).await;
    inner.events.on_disconnected(id);
}

/// Cloneable control surface of a running [`Server`]
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<ServerInner>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Registered connection ids, ascending
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.registry.ids().await
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.len().await
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.registry.get(id).await
    }

    async fn require(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        self.connection(id).await.ok_or(TetherError::NotFound(id))
    }

    pub async fn send(&self, id: ConnectionId, envelope: Envelope, close_after: bool) -> Result<()> {
        self.require(id).await?.send(envelope, close_after).await
    }

    pub async fn send_message(
        &self,
        id: ConnectionId,
        text: impl Into<String>,
        encrypt: bool,
        close_after: bool,
    ) -> Result<()> {
        self.require(id)
            .await?
            .send_message(text, encrypt, close_after)
            .await
    }

    pub async fn send_command(
        &self,
        id: ConnectionId,
        text: impl Into<String>,
        encrypt: bool,
        close_after: bool,
    ) -> Result<()> {
        self.require(id)
            .await?
            .send_command(text, encrypt, close_after)
            .await
    }

    pub async fn send_file(
        &self,
        id: ConnectionId,
        source: impl AsRef<Path>,
        target: &str,
        encrypt: bool,
    ) -> Result<u64> {
        self.require(id)
            .await?
            .send_file(source, target, encrypt)
            .await
    }

    pub async fn send_folder(
        &self,
        id: ConnectionId,
        source: impl AsRef<Path>,
        target: &str,
        encrypt: bool,
    ) -> Result<FolderSummary> {
        self.require(id)
            .await?
            .send_folder(source, target, encrypt)
            .await
    }

    /// Send a message to every registered connection; returns the failures
    pub async fn broadcast_message(
        &self,
        text: &str,
        encrypt: bool,
    ) -> Vec<(ConnectionId, TetherError)> {
        let mut failures = Vec::new();
        for conn in self.inner.registry.snapshot().await {
            if let Err(e) = conn.send_message(text, encrypt, false).await {
                failures.push((conn.id(), e));
            }
        }
        failures
    }

    /// Send a command to every registered connection; returns the failures
    pub async fn broadcast_command(
        &self,
        text: &str,
        encrypt: bool,
    ) -> Vec<(ConnectionId, TetherError)> {
        let mut failures = Vec::new();
        for conn in self.inner.registry.snapshot().await {
            if let Err(e) = conn.send_command(text, encrypt, false).await {
                failures.push((conn.id(), e));
            }
        }
        failures
    }

    /// Close one connection; it leaves the registry once torn down
    pub async fn disconnect(&self, id: ConnectionId) -> Result<()> {
        let conn = self.require(id).await?;
        conn.close();
        conn.closed().await;
        Ok(())
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        info!("Tether server on {} shutting down", self.inner.local_addr);
        self.inner.shutdown.cancel();
    }
}
