//! TCP transport: connections, the reconnecting client and the server.

use tokio::io::{AsyncRead, AsyncWrite};

pub mod client;
pub mod connection;
pub mod registry;
pub mod server;

pub use client::{Client, ClientBuilder, Connector, TcpConnector};
pub use connection::Connection;
pub use registry::Registry;
pub use server::{Server, ServerBuilder, ServerHandle};

/// Byte channel a [`Connection`] runs over: a plain TCP stream, a TLS
/// stream, or anything else that reads and writes (tests use in-memory
/// duplex pipes).
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedTransport = Box<dyn Transport>;
