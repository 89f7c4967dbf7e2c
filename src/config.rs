//! Configuration for connections, clients and servers.
//!
//! Every struct deserialises from TOML with defaults for missing fields.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_PAYLOAD;
use crate::crypto::{ChaChaCipher, PayloadCipher, NONCE_LEN, TAG_LEN};
use crate::types::{Result, TetherError};

/// Reconnect intervals below this are rejected
pub const MIN_RETRY_INTERVAL_SECS: u64 = 3;

/// What happens to a partially received file when its transfer dies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialFilePolicy {
    /// Leave the truncated file on disk
    #[default]
    Keep,
    /// Remove it
    Delete,
}

/// Per-connection settings shared by clients and servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Receive buffer size, also the outbound file chunk size
    pub buffer_size: usize,
    /// Largest declared payload accepted from the peer
    pub max_payload: u32,
    /// Seconds between keep-alive probes
    pub keepalive_interval_secs: u64,
    /// Seconds of inbound silence after which the peer is considered gone
    pub liveness_timeout_secs: u64,
    /// Inbound files land under this directory
    pub receive_dir: PathBuf,
    pub partial_files: PartialFilePolicy,
    /// Shared passphrase for payload encryption
    pub passphrase: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            max_payload: DEFAULT_MAX_PAYLOAD,
            keepalive_interval_secs: 5,
            liveness_timeout_secs: 15,
            receive_dir: PathBuf::from("."),
            partial_files: PartialFilePolicy::Keep,
            passphrase: None,
        }
    }
}

impl ConnectionConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_keepalive(mut self, interval_secs: u64, liveness_timeout_secs: u64) -> Self {
        self.keepalive_interval_secs = interval_secs;
        self.liveness_timeout_secs = liveness_timeout_secs;
        self
    }

    pub fn with_receive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.receive_dir = dir.into();
        self
    }

    pub fn with_partial_files(mut self, policy: PartialFilePolicy) -> Self {
        self.partial_files = policy;
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    /// Cipher derived from the configured passphrase, if any
    pub fn cipher(&self) -> Option<Arc<dyn PayloadCipher>> {
        self.passphrase
            .as_deref()
            .map(|p| Arc::new(ChaChaCipher::from_passphrase(p)) as Arc<dyn PayloadCipher>)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(TetherError::Config("buffer_size must be positive".into()));
        }
        // One sealed chunk must fit in a single envelope
        let largest_chunk = self.buffer_size as u64 + (NONCE_LEN + TAG_LEN) as u64;
        if (self.max_payload as u64) < largest_chunk {
            return Err(TetherError::Config(format!(
                "max_payload {} cannot hold a sealed {}-byte chunk",
                self.max_payload, self.buffer_size
            )));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(TetherError::Config(
                "keepalive_interval_secs must be positive".into(),
            ));
        }
        if self.liveness_timeout_secs <= self.keepalive_interval_secs {
            return Err(TetherError::Config(format!(
                "liveness_timeout_secs ({}) must exceed keepalive_interval_secs ({})",
                self.liveness_timeout_secs, self.keepalive_interval_secs
            )));
        }
        Ok(())
    }
}

/// TLS material for a server: PEM certificate chain and private key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// TLS trust settings for a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTlsConfig {
    /// PEM file with the CA (or self-signed server) certificate to trust
    pub ca_cert_path: PathBuf,
    /// Name the server certificate must be valid for
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the server
    pub address: String,
    /// Fixed delay between failed connect attempts
    pub retry_interval_secs: u64,
    /// Upper bound for a single connect attempt
    pub connect_timeout_secs: u64,
    pub connection: ConnectionConfig,
    pub tls: Option<ClientTlsConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7878".to_string(),
            retry_interval_secs: MIN_RETRY_INTERVAL_SECS,
            connect_timeout_secs: 10,
            connection: ConnectionConfig::default(),
            tls: None,
        }
    }
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_retry_interval(mut self, secs: u64) -> Self {
        self.retry_interval_secs = secs;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| TetherError::Config(e.to_string()))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(TetherError::Config("address must not be empty".into()));
        }
        if self.retry_interval_secs < MIN_RETRY_INTERVAL_SECS {
            return Err(TetherError::Config(format!(
                "retry_interval_secs must be at least {} (got {})",
                MIN_RETRY_INTERVAL_SECS, self.retry_interval_secs
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(TetherError::Config("connect_timeout_secs must be positive".into()));
        }
        self.connection.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub connection: ConnectionConfig,
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7878".to_string(),
            connection: ConnectionConfig::default(),
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            ..Self::default()
        }
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_tls(mut self, tls: ServerTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| TetherError::Config(e.to_string()))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_address.is_empty() {
            return Err(TetherError::Config("bind_address must not be empty".into()));
        }
        self.connection.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ClientConfig::default().validate().unwrap();
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn retry_interval_minimum() {
        let config = ClientConfig::new("localhost:1").with_retry_interval(2);
        assert!(matches!(config.validate(), Err(TetherError::Config(_))));
        ClientConfig::new("localhost:1")
            .with_retry_interval(3)
            .validate()
            .unwrap();
    }

    #[test]
    fn chunk_must_fit_after_sealing() {
        let conn = ConnectionConfig::default()
            .with_buffer_size(1024)
            .with_max_payload(1024);
        assert!(conn.validate().is_err());

        let conn = conn.with_max_payload(1024 + 28);
        conn.validate().unwrap();
    }

    #[test]
    fn liveness_must_exceed_interval() {
        let conn = ConnectionConfig::default().with_keepalive(5, 5);
        assert!(conn.validate().is_err());
        assert!(ConnectionConfig::default().with_keepalive(0, 5).validate().is_err());
    }

    #[test]
    fn client_from_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            address = "10.0.0.2:9000"
            retry_interval_secs = 5

            [connection]
            buffer_size = 4096
            receive_dir = "/tmp/inbox"
            partial_files = "delete"
            passphrase = "hunter2"

            [tls]
            ca_cert_path = "ca.pem"
            server_name = "files.local"
            "#,
        )
        .unwrap();

        assert_eq!(config.address, "10.0.0.2:9000");
        assert_eq!(config.retry_interval(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.connection.buffer_size, 4096);
        assert_eq!(config.connection.max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(config.connection.partial_files, PartialFilePolicy::Delete);
        assert!(config.connection.cipher().is_some());
        assert_eq!(config.tls.unwrap().server_name, "files.local");
    }

    #[test]
    fn server_from_toml_defaults() {
        let config = ServerConfig::from_toml_str("bind_address = \"0.0.0.0:7000\"").unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:7000");
        assert_eq!(config.connection, ConnectionConfig::default());
        assert!(config.tls.is_none());
        assert!(config.connection.cipher().is_none());
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        assert!(matches!(
            ServerConfig::from_toml_str("bind_address = 7"),
            Err(TetherError::Config(_))
        ));
    }
}
