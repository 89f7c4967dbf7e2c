//! # Tether
//!
//! A duplex, message-oriented TCP transport:
//!
//! * **Reconnecting client** that retries at a fixed interval for as long as it runs
//! * **Multi-client server** with a registry of live connections keyed by id
//! * **Envelopes** for text messages, commands and streamed file transfers
//! * **Optional encryption** of payloads (ChaCha20-Poly1305) and of the whole
//!   channel (TLS via rustls)
//!
//! ## Quick Start
//!
//! ```rust
//! use tether::{envelope, EnvelopeKind};
//! use bytes::BytesMut;
//!
//! let wire = envelope::encode_envelope(EnvelopeKind::Message, b"Hello, tether!", false, None)?;
//!
//! let mut buf = BytesMut::from(&wire[..]);
//! let decoded = envelope::try_decode_envelope(&mut buf, 1024, None)?.unwrap();
//!
//! assert_eq!(decoded.kind(), EnvelopeKind::Message);
//! assert_eq!(decoded.text(), "Hello, tether!");
//! # Ok::<(), tether::TetherError>(())
//! ```
//!
//! ## Wire Format
//!
//! Every envelope is an 11-byte header followed by exactly `LEN` payload bytes:
//!
//! - MAGIC (2B): `0x54 0x48` ("TH")
//! - VER (1B): protocol version (`0x01`)
//! - KIND (1B): envelope kind
//! - FLAGS (1B): `0x01` = payload encrypted
//! - LEN (4B BE): payload length
//! - HCRC (2B BE): CRC-16/ARC over the first 9 header bytes
//!
//! Encrypted payloads are `nonce(12) | ciphertext | tag(16)`.
//!
//! ## Envelope Kinds
//!
//! | Kind | Name       | Payload                                 |
//! |------|------------|-----------------------------------------|
//! | 0x01 | MESSAGE    | UTF-8 text                              |
//! | 0x02 | COMMAND    | UTF-8 text                              |
//! | 0x03 | FILE_START | JSON `{"path": .., "size": ..}`         |
//! | 0x04 | FILE_CHUNK | Raw file bytes                          |
//! | 0x05 | FILE_END   | Empty                                   |
//! | 0x06 | ACK        | Empty (keep-alive probe)                |

pub mod codec;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod events;
pub mod receive;
pub mod tcp;
pub mod tls;
pub mod transfer;
pub mod types;

pub use codec::{EnvelopeCodec, DEFAULT_MAX_PAYLOAD};
pub use config::{
    ClientConfig, ClientTlsConfig, ConnectionConfig, PartialFilePolicy, ServerConfig,
    ServerTlsConfig,
};
pub use crypto::{ChaChaCipher, PayloadCipher};
pub use events::{ChannelEvents, Event, EventHandler, EventStream, NoopEvents, TracingEvents};
pub use receive::{ParseState, ReceiveMachine, Received};
pub use tcp::{Client, Connection, Server, ServerHandle};
pub use transfer::FolderSummary;
pub use types::{
    ConnectionId, Envelope, EnvelopeHeader, EnvelopeKind, FileMeta, Flags, ProtocolError, Result,
    TetherError, CLIENT_CONNECTION_ID,
};
