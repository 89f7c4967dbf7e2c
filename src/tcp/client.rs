//! Reconnecting client.
//!
//! A single supervisor task owns the connect sequence: it retries at a fixed
//! interval until a connect succeeds, runs the connection until it dies, and
//! starts over. Only the supervisor ever builds a connection, so at most one
//! attempt is in flight.

use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConnectionConfig};
use crate::crypto::PayloadCipher;
use crate::events::{EventHandler, NoopEvents};
use crate::tcp::{BoxedTransport, Connection};
use crate::tls;
use crate::transfer::FolderSummary;
use crate::types::{Envelope, Result, TetherError, CLIENT_CONNECTION_ID};

/// Opens the byte channel to the server
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<(BoxedTransport, Option<SocketAddr>)>>;
}

/// TCP, optionally wrapped in TLS
pub struct TcpConnector {
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl TcpConnector {
    pub fn plain() -> Self {
        Self { tls: None }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let tls = match &config.tls {
            Some(tls_config) => Some(tls::client_connector(tls_config)?),
            None => None,
        };
        Ok(Self { tls })
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<(BoxedTransport, Option<SocketAddr>)>> {
        Box::pin(async move {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            let peer = stream.peer_addr().ok();

            match &self.tls {
                Some((connector, name)) => {
                    let stream = connector.connect(name.clone(), stream).await?;
                    debug!("TLS handshake with {} complete", address);
                    Ok((Box::new(stream) as BoxedTransport, peer))
                }
                None => Ok((Box::new(stream) as BoxedTransport, peer)),
            }
        })
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
    events: Option<Arc<dyn EventHandler>>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    connector: Option<Arc<dyn Connector>>,
}

impl ClientBuilder {
    pub fn handler(mut self, events: impl EventHandler) -> Self {
        self.events = Some(Arc::new(events));
        self
    }

    /// Override the cipher derived from the configured passphrase
    pub fn cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector::from_config(&self.config)?),
        };
        let cipher = self.cipher.or_else(|| self.config.connection.cipher());

        Ok(Client {
            inner: Arc::new(ClientInner {
                connection_config: Arc::new(self.config.connection.clone()),
                config: self.config,
                events: self
                    .events
                    .unwrap_or_else(|| Arc::new(NoopEvents) as Arc<dyn EventHandler>),
                cipher,
                connector,
                current: RwLock::new(None),
                shutdown: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        })
    }
}

struct ClientInner {
    config: ClientConfig,
    connection_config: Arc<ConnectionConfig>,
    events: Arc<dyn EventHandler>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    connector: Arc<dyn Connector>,
    current: RwLock<Option<Arc<Connection>>>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Client side of a tether link. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            events: None,
            cipher: None,
            connector: None,
        }
    }

    /// Launch the supervisor. Calling it again has no effect.
    pub async fn start(&self) {
        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Client starting, server {}", self.inner.config.address);
        *supervisor = Some(tokio::spawn(supervise(self.inner.clone())));
    }

    pub async fn is_connected(&self) -> bool {
        match self.inner.current.read().await.as_ref() {
            Some(conn) => conn.is_connected(),
            None => false,
        }
    }

    /// The live connection, if any
    pub async fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.current.read().await.clone()
    }

    async fn require(&self) -> Result<Arc<Connection>> {
        self.connection().await.ok_or(TetherError::NotConnected)
    }

    pub async fn send(&self, envelope: Envelope, close_after: bool) -> Result<()> {
        self.require().await?.send(envelope, close_after).await
    }

    pub async fn send_message(
        &self,
        text: impl Into<String>,
        encrypt: bool,
        close_after: bool,
    ) -> Result<()> {
        self.require()
            .await?
            .send_message(text, encrypt, close_after)
            .await
    }

    pub async fn send_command(
        &self,
        text: impl Into<String>,
        encrypt: bool,
        close_after: bool,
    ) -> Result<()> {
        self.require()
            .await?
            .send_command(text, encrypt, close_after)
            .await
    }

    pub async fn send_file(
        &self,
        source: impl AsRef<Path>,
        target: &str,
        encrypt: bool,
    ) -> Result<u64> {
        self.require().await?.send_file(source, target, encrypt).await
    }

    pub async fn send_folder(
        &self,
        source: impl AsRef<Path>,
        target: &str,
        encrypt: bool,
    ) -> Result<FolderSummary> {
        self.require().await?.send_folder(source, target, encrypt).await
    }

    /// Stop reconnecting, close the live connection and wait for the
    /// supervisor to exit
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            let _ = handle.await;
        }
        info!("Client stopped");
    }
}

async fn supervise(inner: Arc<ClientInner>) {
    let address = inner.config.address.as_str();
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        let connect = tokio::time::timeout(
            inner.config.connect_timeout(),
            inner.connector.connect(address),
        );
        let outcome = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            outcome = connect => outcome,
        };

        match outcome {
            Ok(Ok((transport, peer))) => {
                attempt = 0;
                let conn = Connection::new(
                    CLIENT_CONNECTION_ID,
                    transport,
                    peer,
                    inner.connection_config.clone(),
                    inner.cipher.clone(),
                    inner.events.clone(),
                );
                *inner.current.write().await = Some(conn.clone());
                inner.events.on_connected(CLIENT_CONNECTION_ID);
                conn.start();

                tokio::select! {
                    _ = conn.closed() => {}
                    _ = inner.shutdown.cancelled() => {
                        conn.close();
                        conn.closed().await;
                    }
                }

                inner.current.write().await.take();
                inner.events.on_disconnected(CLIENT_CONNECTION_ID);
                if inner.shutdown.is_cancelled() {
                    break;
                }
                info!("Lost connection to {}, reconnecting", address);
                continue;
            }
            Ok(Err(e)) => warn!("Connect attempt {} to {} failed: {}", attempt, address, e),
            Err(_) => warn!("Connect attempt {} to {} timed out", attempt, address),
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.config.retry_interval()) => {}
        }
    }
    debug!("Client supervisor for {} exiting", address);
}
