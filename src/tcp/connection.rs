//! One live duplex channel: a receive task, a keep-alive task and a
//! serialised send path.

use bytes::Bytes;
use futures::SinkExt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::EnvelopeCodec;
use crate::config::{ConnectionConfig, PartialFilePolicy};
use crate::crypto::PayloadCipher;
use crate::events::EventHandler;
use crate::receive::{ReceiveMachine, Received};
use crate::tcp::BoxedTransport;
use crate::transfer::{self, FolderSummary, TransferSession};
use crate::types::{
    ConnectionId, Envelope, EnvelopeKind, ProtocolError, Result, TetherError,
};

type EnvelopeWriter = FramedWrite<WriteHalf<BoxedTransport>, EnvelopeCodec>;

/// Bound on flushing a TLS close or TCP shutdown during teardown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    config: Arc<ConnectionConfig>,
    events: Arc<dyn EventHandler>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    /// Send gate: one envelope in flight, waiters served in FIFO order
    writer: Mutex<Option<EnvelopeWriter>>,
    /// Read half until the receive task takes it
    pending_reader: StdMutex<Option<ReadHalf<BoxedTransport>>>,
    /// One outbound file or folder transfer at a time
    transfer_gate: Mutex<()>,
    connected: AtomicBool,
    shutdown: CancellationToken,
    finished: CancellationToken,
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl Connection {
    /// Take ownership of a connected transport without reading from it.
    ///
    /// Sends work right away; nothing is received and no keep-alive runs
    /// until [`start`](Self::start). Owners register the connection and
    /// raise `on_connected` in between, so no inbound event can precede it.
    pub fn new(
        id: ConnectionId,
        transport: BoxedTransport,
        peer: Option<SocketAddr>,
        config: Arc<ConnectionConfig>,
        cipher: Option<Arc<dyn PayloadCipher>>,
        events: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(transport);
        let codec = EnvelopeCodec::new(config.max_payload).with_cipher(cipher.clone());

        match peer {
            Some(addr) => info!("Connection {} up with {}", id, addr),
            None => info!("Connection {} up", id),
        }

        Arc::new(Self {
            id,
            peer,
            config,
            events,
            cipher,
            writer: Mutex::new(Some(FramedWrite::new(writer, codec))),
            pending_reader: StdMutex::new(Some(reader)),
            transfer_gate: Mutex::new(()),
            connected: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        })
    }

    /// Launch the receive and keep-alive tasks. Later calls do nothing.
    pub fn start(self: &Arc<Self>) {
        let Some(reader) = self.take_pending_reader() else {
            return;
        };
        self.touch();
        tokio::spawn(self.clone().receive_loop(reader));
        tokio::spawn(self.clone().keepalive_loop());
    }

    #[cfg(test)]
    pub(crate) fn spawn(
        id: ConnectionId,
        transport: BoxedTransport,
        peer: Option<SocketAddr>,
        config: Arc<ConnectionConfig>,
        cipher: Option<Arc<dyn PayloadCipher>>,
        events: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        let conn = Self::new(id, transport, peer, config, cipher, events);
        conn.start();
        conn
    }

    fn take_pending_reader(&self) -> Option<ReadHalf<BoxedTransport>> {
        match self.pending_reader.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Time since bytes last arrived from the peer
    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_seen_ms.load(Ordering::Acquire)))
    }

    /// Write one envelope, then report it submitted. With `close_after` the
    /// connection is closed once the write completes.
    pub async fn send(&self, envelope: Envelope, close_after: bool) -> Result<()> {
        self.send_envelope(envelope).await?;
        self.events.on_message_submitted(self.id, close_after);
        if close_after {
            debug!("Connection {} closing after send", self.id);
            self.close();
        }
        Ok(())
    }

    pub async fn send_message(
        &self,
        text: impl Into<String>,
        encrypt: bool,
        close_after: bool,
    ) -> Result<()> {
        let envelope =
            Envelope::new(EnvelopeKind::Message, Bytes::from(text.into())).with_encryption(encrypt);
        self.send(envelope, close_after).await
    }

    pub async fn send_command(
        &self,
        text: impl Into<String>,
        encrypt: bool,
        close_after: bool,
    ) -> Result<()> {
        let envelope =
            Envelope::new(EnvelopeKind::Command, Bytes::from(text.into())).with_encryption(encrypt);
        self.send(envelope, close_after).await
    }

    /// Stream a file to the peer; resolves once the file-end is written
    pub async fn send_file(
        &self,
        source: impl AsRef<Path>,
        target: &str,
        encrypt: bool,
    ) -> Result<u64> {
        transfer::send_file(self, source.as_ref(), target, encrypt).await
    }

    pub async fn send_folder(
        &self,
        source: impl AsRef<Path>,
        target: &str,
        encrypt: bool,
    ) -> Result<FolderSummary> {
        transfer::send_folder(self, source.as_ref(), target, encrypt).await
    }

    /// Start tearing the connection down. Idempotent and non-blocking;
    /// await [`closed`](Self::closed) for completion.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!("Connection {} closing", self.id);
        }
        self.shutdown.cancel();
        if self.take_pending_reader().is_some() {
            // Never started: no receive task will finish the teardown
            self.finished.cancel();
        }
    }

    /// Resolves once the socket and any inbound transfer have been released
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }

    pub(crate) fn transfer_gate(&self) -> &Mutex<()> {
        &self.transfer_gate
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Write through the send gate without raising events
    pub(crate) async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        if !self.is_connected() {
            return Err(TetherError::NotConnected);
        }

        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = self.shutdown.cancelled() => return Err(TetherError::Closed),
        };
        let writer = guard.as_mut().ok_or(TetherError::NotConnected)?;

        let result = tokio::select! {
            result = writer.send(envelope) => result,
            _ = self.shutdown.cancelled() => Err(TetherError::Closed),
        };
        if let Err(TetherError::Io(e)) = &result {
            warn!("Connection {} write failed: {}", self.id, e);
            self.close();
        }
        result
    }

    fn touch(&self) {
        self.last_seen_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
    }

    async fn receive_loop(self: Arc<Self>, mut reader: ReadHalf<BoxedTransport>) {
        let mut machine = ReceiveMachine::new(self.config.max_payload, self.cipher.clone());
        let mut buf = vec![0u8; self.config.buffer_size];
        let mut items = Vec::new();
        let mut session: Option<TransferSession> = None;

        loop {
            let n = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("Connection {} closed by peer", self.id);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Connection {} read failed: {}", self.id, e);
                        break;
                    }
                },
            };

            self.touch();
            machine.feed(&buf[..n], &mut items);
            for item in items.drain(..) {
                self.dispatch(item, &mut machine, &mut session).await;
            }
        }

        self.close();
        if let Some(active) = session.take() {
            active.abandon(self.config.partial_files).await;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.close()).await;
        }
        drop(reader);
        info!("Connection {} ended", self.id);
        self.finished.cancel();
    }

    async fn dispatch(
        &self,
        item: Received,
        machine: &mut ReceiveMachine,
        session: &mut Option<TransferSession>,
    ) {
        match item {
            Received::Envelope(envelope) => {
                if envelope.kind() == EnvelopeKind::Ack {
                    trace!("Connection {} keep-alive ack", self.id);
                } else {
                    self.events
                        .on_message_received(self.id, &envelope.header, &envelope.text());
                }
            }

            Received::FileStart { header, meta } => {
                if let Some(previous) = session.take() {
                    previous.abandon(self.config.partial_files).await;
                }
                match TransferSession::open(
                    self.id,
                    &self.config.receive_dir,
                    &meta,
                    header.is_encrypted(),
                    self.events.clone(),
                )
                .await
                {
                    Ok(opened) => *session = Some(opened),
                    Err(e) => {
                        self.events
                            .on_transfer_failed(self.id, Path::new(&meta.path), &e);
                        machine.abort_transfer();
                    }
                }
            }

            Received::FileData(bytes) => {
                if let Some(active) = session.as_mut() {
                    if let Err(e) = active.write(&bytes).await {
                        if let Some(active) = session.take() {
                            self.fail_transfer(active, e, machine).await;
                        }
                    }
                }
            }

            Received::FileEnd => {
                if let Some(active) = session.take() {
                    let target = active.target().to_path_buf();
                    debug!(
                        "Connection {} finishing {} ({}/{} bytes, encrypted={})",
                        self.id,
                        target.display(),
                        active.written(),
                        active.total(),
                        active.is_encrypted()
                    );
                    match active.finish().await {
                        Ok(path) => self.events.on_file_received(self.id, &path),
                        Err(e) => {
                            self.events.on_transfer_failed(self.id, &target, &e);
                            if self.config.partial_files == PartialFilePolicy::Delete {
                                transfer::remove_partial(&target).await;
                            }
                        }
                    }
                }
            }

            Received::Fault(error) => {
                debug!(
                    "Connection {} fault ({} bytes skipped so far): {}",
                    self.id,
                    machine.discarded_bytes(),
                    error
                );
                self.events.on_protocol_fault(self.id, &error);
                let chunk_lost = matches!(
                    error,
                    ProtocolError::Decrypt(EnvelopeKind::FileChunk)
                        | ProtocolError::MissingCipher(EnvelopeKind::FileChunk)
                );
                if chunk_lost {
                    if let Some(active) = session.take() {
                        self.fail_transfer(active, TetherError::Protocol(error), machine)
                            .await;
                    }
                }
            }
        }
    }

    async fn fail_transfer(
        &self,
        session: TransferSession,
        error: TetherError,
        machine: &mut ReceiveMachine,
    ) {
        self.events
            .on_transfer_failed(self.id, session.target(), &error);
        machine.abort_transfer();
        session.abandon(self.config.partial_files).await;
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let interval = self.config.keepalive_interval();
        let liveness = self.config.liveness_timeout();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let idle = self.idle_for();
            if idle >= liveness {
                warn!(
                    "Connection {} silent for {:?}, considering peer gone",
                    self.id, idle
                );
                break;
            }

            let probe = Envelope::new(EnvelopeKind::Ack, Bytes::new());
            match tokio::time::timeout(liveness, self.send_envelope(probe)).await {
                Ok(Ok(())) => trace!("Connection {} probe sent", self.id),
                Ok(Err(TetherError::Closed)) | Ok(Err(TetherError::NotConnected)) => return,
                Ok(Err(e)) => {
                    warn!("Connection {} keep-alive failed: {}", self.id, e);
                    break;
                }
                Err(_) => {
                    warn!("Connection {} keep-alive probe timed out", self.id);
                    break;
                }
            }
        }
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}
