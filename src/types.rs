//! Core types for the tether transport

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Tether magic bytes ("TH")
pub const TETHER_MAGIC: [u8; 2] = [0x54, 0x48];

/// Current protocol version
pub const TETHER_VERSION: u8 = 0x01;

/// Fixed size of an envelope header on the wire
pub const HEADER_LEN: usize = 11;

/// Identifier of one connection.
///
/// Servers hand out ids starting at 1 and never reuse them while the process
/// runs. A client only ever owns one connection and reports it as
/// [`CLIENT_CONNECTION_ID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

/// Id used for the single connection owned by a [`Client`](crate::tcp::Client)
pub const CLIENT_CONNECTION_ID: ConnectionId = ConnectionId(0);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    Message = 0x01,
    Command = 0x02,
    FileStart = 0x03,
    FileChunk = 0x04,
    FileEnd = 0x05,
    Ack = 0x06,
}

impl EnvelopeKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(EnvelopeKind::Message),
            0x02 => Some(EnvelopeKind::Command),
            0x03 => Some(EnvelopeKind::FileStart),
            0x04 => Some(EnvelopeKind::FileChunk),
            0x05 => Some(EnvelopeKind::FileEnd),
            0x06 => Some(EnvelopeKind::Ack),
            _ => None,
        }
    }
}

bitflags! {
    /// Header flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        /// Payload is sealed with the connection's payload cipher
        const ENCRYPTED = 0b0000_0001;
    }
}

/// Parsed envelope header.
///
/// `payload_len` is the declared on-wire length, i.e. the sealed size when the
/// envelope is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub kind: EnvelopeKind,
    pub flags: Flags,
    pub payload_len: u32,
}

impl EnvelopeHeader {
    pub fn new(kind: EnvelopeKind, payload_len: u32, encrypted: bool) -> Self {
        let flags = if encrypted {
            Flags::ENCRYPTED
        } else {
            Flags::empty()
        };
        Self {
            kind,
            flags,
            payload_len,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(Flags::ENCRYPTED)
    }
}

/// One complete logical unit: header plus payload.
///
/// On the receive side `payload` holds the decoded (decrypted) bytes. On the
/// send side it holds the plaintext and the encoder seals it when the
/// encrypted flag is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub payload: Bytes,
}

impl Envelope {
    /// Create an unencrypted envelope of the given kind
    pub fn new(kind: EnvelopeKind, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        Self {
            header: EnvelopeHeader::new(kind, len, false),
            payload,
        }
    }

    /// Request (or drop) payload encryption
    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.header.flags.set(Flags::ENCRYPTED, encrypted);
        self
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.header.kind
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.is_encrypted()
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Metadata carried by a file-start envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Target path relative to the receiver's receive directory, `/` separated
    pub path: String,
    /// Total number of file bytes that follow
    pub size: u64,
}

/// Errors found while parsing the inbound byte stream.
///
/// These never tear a connection down; the receive machine drops the
/// offending envelope and carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid magic bytes: {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("header checksum mismatch: expected {expected:04x}, got {actual:04x}")]
    HeaderChecksum { expected: u16, actual: u16 },

    #[error("unknown envelope kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("unknown header flags: {0:#010b}")]
    UnknownFlags(u8),

    #[error("payload too large: {len} bytes (max: {max})")]
    PayloadTooLarge { len: u64, max: u32 },

    #[error("encrypted {0:?} envelope but no payload cipher is configured")]
    MissingCipher(EnvelopeKind),

    #[error("failed to decrypt {0:?} payload")]
    Decrypt(EnvelopeKind),

    #[error("invalid file metadata: {0}")]
    InvalidMetadata(String),

    #[error("unexpected {0:?} envelope outside of a transfer")]
    UnexpectedEnvelope(EnvelopeKind),
}

/// Tether error type
#[derive(Error, Debug)]
pub enum TetherError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection {0} not found")]
    NotFound(ConnectionId),

    #[error("Connection closed")]
    Closed,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transfer of {path:?} failed: {source}")]
    Transfer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsafe transfer path: {0}")]
    UnsafePath(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, TetherError>;
