//! Lifecycle and content notifications.
//!
//! Handlers run inline on the connection's receive task, so they must return
//! quickly. Every method has a no-op default; implement only what you need.

use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::types::{ConnectionId, EnvelopeHeader, EnvelopeKind, ProtocolError, TetherError};

pub trait EventHandler: Send + Sync + 'static {
    fn on_server_started(&self) {}
    fn on_connected(&self, _id: ConnectionId) {}
    fn on_disconnected(&self, _id: ConnectionId) {}
    /// A message or command arrived; `header.kind` tells them apart
    fn on_message_received(&self, _id: ConnectionId, _header: &EnvelopeHeader, _text: &str) {}
    fn on_message_submitted(&self, _id: ConnectionId, _close_after: bool) {}
    fn on_file_received(&self, _id: ConnectionId, _path: &Path) {}
    fn on_transfer_progress(&self, _id: ConnectionId, _bytes_so_far: u64, _total: u64) {}
    fn on_transfer_failed(&self, _id: ConnectionId, _path: &Path, _error: &TetherError) {}
    fn on_protocol_fault(&self, _id: ConnectionId, _error: &ProtocolError) {}
}

/// Ignores everything
pub struct NoopEvents;
impl EventHandler for NoopEvents {}

/// Logs every event through `tracing`
pub struct TracingEvents;

impl EventHandler for TracingEvents {
    fn on_server_started(&self) {
        info!("Server started");
    }
    fn on_connected(&self, id: ConnectionId) {
        info!("Connection {} established", id);
    }
    fn on_disconnected(&self, id: ConnectionId) {
        info!("Connection {} lost", id);
    }
    fn on_message_received(&self, id: ConnectionId, header: &EnvelopeHeader, text: &str) {
        info!("Connection {} {:?}: {}", id, header.kind, text);
    }
    fn on_message_submitted(&self, id: ConnectionId, close_after: bool) {
        debug!("Connection {} submitted (close_after={})", id, close_after);
    }
    fn on_file_received(&self, id: ConnectionId, path: &Path) {
        info!("Connection {} received file {}", id, path.display());
    }
    fn on_transfer_progress(&self, id: ConnectionId, bytes_so_far: u64, total: u64) {
        let pct = if total == 0 {
            100.0
        } else {
            bytes_so_far as f64 * 100.0 / total as f64
        };
        debug!("Connection {} transfer {}/{} ({:.1}%)", id, bytes_so_far, total, pct);
    }
    fn on_transfer_failed(&self, id: ConnectionId, path: &Path, error: &TetherError) {
        warn!("Connection {} transfer of {} failed: {}", id, path.display(), error);
    }
    fn on_protocol_fault(&self, id: ConnectionId, error: &ProtocolError) {
        warn!("Connection {} dropped an envelope: {}", id, error);
    }
}

/// Owned form of every callback, as delivered by [`ChannelEvents`]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ServerStarted,
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    MessageReceived {
        id: ConnectionId,
        kind: EnvelopeKind,
        encrypted: bool,
        text: String,
    },
    MessageSubmitted {
        id: ConnectionId,
        close_after: bool,
    },
    FileReceived {
        id: ConnectionId,
        path: PathBuf,
    },
    TransferProgress {
        id: ConnectionId,
        bytes_so_far: u64,
        total: u64,
    },
    TransferFailed {
        id: ConnectionId,
        path: PathBuf,
        error: String,
    },
    ProtocolFault {
        id: ConnectionId,
        error: ProtocolError,
    },
}

/// Stream of [`Event`]s produced by a [`ChannelEvents`] handler
pub type EventStream = UnboundedReceiverStream<Event>;

/// Forwards callbacks into an unbounded channel, exposed as a stream
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEvents {
    pub fn new() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UnboundedReceiverStream::new(rx))
    }

    fn emit(&self, event: Event) {
        // Receiver dropped: nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl EventHandler for ChannelEvents {
    fn on_server_started(&self) {
        self.emit(Event::ServerStarted);
    }
    fn on_connected(&self, id: ConnectionId) {
        self.emit(Event::Connected(id));
    }
    fn on_disconnected(&self, id: ConnectionId) {
        self.emit(Event::Disconnected(id));
    }
    fn on_message_received(&self, id: ConnectionId, header: &EnvelopeHeader, text: &str) {
        self.emit(Event::MessageReceived {
            id,
            kind: header.kind,
            encrypted: header.is_encrypted(),
            text: text.to_string(),
        });
    }
    fn on_message_submitted(&self, id: ConnectionId, close_after: bool) {
        self.emit(Event::MessageSubmitted { id, close_after });
    }
    fn on_file_received(&self, id: ConnectionId, path: &Path) {
        self.emit(Event::FileReceived {
            id,
            path: path.to_path_buf(),
        });
    }
    fn on_transfer_progress(&self, id: ConnectionId, bytes_so_far: u64, total: u64) {
        self.emit(Event::TransferProgress {
            id,
            bytes_so_far,
            total,
        });
    }
    fn on_transfer_failed(&self, id: ConnectionId, path: &Path, error: &TetherError) {
        self.emit(Event::TransferFailed {
            id,
            path: path.to_path_buf(),
            error: error.to_string(),
        });
    }
    fn on_protocol_fault(&self, id: ConnectionId, error: &ProtocolError) {
        self.emit(Event::ProtocolFault {
            id,
            error: error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn channel_events_preserve_order() {
        let (events, stream) = ChannelEvents::new();
        let header = EnvelopeHeader::new(EnvelopeKind::Command, 4, true);

        events.on_connected(ConnectionId(3));
        events.on_message_received(ConnectionId(3), &header, "ping");
        events.on_transfer_progress(ConnectionId(3), 5, 10);
        events.on_disconnected(ConnectionId(3));
        drop(events);

        let all: Vec<Event> = stream.collect().await;
        assert_eq!(
            all,
            vec![
                Event::Connected(ConnectionId(3)),
                Event::MessageReceived {
                    id: ConnectionId(3),
                    kind: EnvelopeKind::Command,
                    encrypted: true,
                    text: "ping".into(),
                },
                Event::TransferProgress {
                    id: ConnectionId(3),
                    bytes_so_far: 5,
                    total: 10,
                },
                Event::Disconnected(ConnectionId(3)),
            ]
        );
    }

    #[test]
    fn emitting_after_receiver_dropped_is_harmless() {
        let (events, stream) = ChannelEvents::new();
        drop(stream);
        events.on_server_started();
        events.on_file_received(ConnectionId(1), Path::new("a"));
    }
}
