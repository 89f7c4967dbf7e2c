//! Per-connection receive state machine.
//!
//! Turns socket read results of any size into completed envelopes and file
//! stream items. Header and payload boundaries may fall anywhere inside a
//! read. The machine does no I/O itself: the connection's receive loop feeds
//! it each read and routes the produced [`Received`] items.
//!
//! State transitions within one envelope are strictly linear:
//!
//! ```text
//! AwaitingHeader -> AccumulatingBody -> AwaitingHeader
//! AwaitingHeader -> StreamingFile    -> AwaitingHeader
//! any            -> Faulted          -> AwaitingHeader
//! ```

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::crypto::PayloadCipher;
use crate::envelope::{decode_header, open_payload};
use crate::types::{
    Envelope, EnvelopeHeader, EnvelopeKind, FileMeta, ProtocolError, HEADER_LEN, TETHER_MAGIC,
};

/// Current parse state of one connection
#[derive(Debug)]
pub enum ParseState {
    /// Collecting the fixed-size header
    AwaitingHeader,
    /// Buffering a payload in memory until the declared length is reached
    AccumulatingBody {
        header: EnvelopeHeader,
        body: BytesMut,
    },
    /// Passing plain file-chunk bytes straight through as they arrive
    StreamingFile {
        header: EnvelopeHeader,
        remaining: u32,
    },
    /// The in-flight envelope is being discarded
    Faulted {
        error: ProtocolError,
        /// The header itself was bad and the stream must be resynchronised
        resync: bool,
    },
}

impl ParseState {
    pub fn name(&self) -> &'static str {
        match self {
            ParseState::AwaitingHeader => "AwaitingHeader",
            ParseState::AccumulatingBody { .. } => "AccumulatingBody",
            ParseState::StreamingFile { .. } => "StreamingFile",
            ParseState::Faulted { .. } => "Faulted",
        }
    }
}

/// Output of [`ReceiveMachine::feed`]
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// A complete message, command or ack
    Envelope(Envelope),
    /// A transfer begins
    FileStart {
        header: EnvelopeHeader,
        meta: FileMeta,
    },
    /// Decoded bytes for the active transfer
    FileData(Bytes),
    /// The active transfer is complete
    FileEnd,
    /// An envelope was dropped
    Fault(ProtocolError),
}

#[derive(Debug)]
struct InboundTransfer {
    total: u64,
    received: u64,
    /// The consumer gave up on this transfer; swallow its remaining chunks
    skipping: bool,
}

/// Receive state machine for one connection
#[derive(Debug)]
pub struct ReceiveMachine {
    state: ParseState,
    header_buf: [u8; HEADER_LEN],
    header_filled: usize,
    max_payload: u32,
    cipher: Option<Arc<dyn PayloadCipher>>,
    transfer: Option<InboundTransfer>,
    resyncing: bool,
    discarded: u64,
}

impl ReceiveMachine {
    pub fn new(max_payload: u32, cipher: Option<Arc<dyn PayloadCipher>>) -> Self {
        Self {
            state: ParseState::AwaitingHeader,
            header_buf: [0u8; HEADER_LEN],
            header_filled: 0,
            max_payload,
            cipher,
            transfer: None,
            resyncing: false,
            discarded: 0,
        }
    }

    pub fn state(&self) -> &ParseState {
        &self.state
    }

    /// Whether a file-start has been seen and its file-end has not
    pub fn transfer_active(&self) -> bool {
        self.transfer.is_some()
    }

    /// Bytes of the active transfer seen so far, with the declared total
    pub fn transfer_progress(&self) -> Option<(u64, u64)> {
        self.transfer.as_ref().map(|t| (t.received, t.total))
    }

    /// Total bytes skipped while resynchronising after bad headers
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Stop producing [`Received::FileData`] for the active transfer.
    ///
    /// Its remaining chunks are consumed silently and its file-end yields
    /// nothing.
    pub fn abort_transfer(&mut self) {
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.skipping = true;
        }
    }

    /// Drop every piece of in-flight state
    pub fn reset(&mut self) {
        self.state = ParseState::AwaitingHeader;
        self.header_filled = 0;
        self.transfer = None;
        self.resyncing = false;
    }

    /// Consume one read's worth of bytes, appending produced items to `out`.
    ///
    /// All of `data` is consumed; a trailing partial envelope stays buffered
    /// until the next call.
    pub fn feed(&mut self, mut data: &[u8], out: &mut Vec<Received>) {
        while !data.is_empty() || matches!(self.state, ParseState::Faulted { .. }) {
            let state = std::mem::replace(&mut self.state, ParseState::AwaitingHeader);
            self.state = self.transition(state, &mut data, out);
        }
    }

    fn transition(
        &mut self,
        state: ParseState,
        data: &mut &[u8],
        out: &mut Vec<Received>,
    ) -> ParseState {
        match state {
            ParseState::AwaitingHeader => {
                let take = (HEADER_LEN - self.header_filled).min(data.len());
                self.header_buf[self.header_filled..self.header_filled + take]
                    .copy_from_slice(&data[..take]);
                self.header_filled += take;
                *data = &data[take..];

                if self.header_filled < HEADER_LEN {
                    return ParseState::AwaitingHeader;
                }
                match decode_header(&self.header_buf, self.max_payload) {
                    Ok(Some(header)) => {
                        self.header_filled = 0;
                        self.resyncing = false;
                        trace!(
                            "Header parsed: {:?}, {} payload bytes",
                            header.kind,
                            header.payload_len
                        );
                        self.begin(header, out)
                    }
                    Ok(None) => ParseState::AwaitingHeader,
                    Err(error) => ParseState::Faulted {
                        error,
                        resync: true,
                    },
                }
            }

            ParseState::AccumulatingBody { header, mut body } => {
                let needed = header.payload_len as usize - body.len();
                let take = needed.min(data.len());
                body.extend_from_slice(&data[..take]);
                *data = &data[take..];

                if body.len() == header.payload_len as usize {
                    self.complete(header, body.freeze(), out)
                } else {
                    ParseState::AccumulatingBody { header, body }
                }
            }

            ParseState::StreamingFile { header, remaining } => {
                let take = (remaining as usize).min(data.len());
                let chunk = Bytes::copy_from_slice(&data[..take]);
                *data = &data[take..];
                self.stream_chunk(chunk, out);

                let remaining = remaining - take as u32;
                if remaining == 0 {
                    ParseState::AwaitingHeader
                } else {
                    ParseState::StreamingFile { header, remaining }
                }
            }

            ParseState::Faulted { error, resync } => {
                if !self.resyncing {
                    debug!("Dropping in-flight envelope: {}", error);
                    out.push(Received::Fault(error));
                }
                if resync {
                    self.resyncing = true;
                    self.slide_header();
                } else {
                    self.header_filled = 0;
                }
                ParseState::AwaitingHeader
            }
        }
    }

    /// Shift the rejected header window to the next possible magic start
    fn slide_header(&mut self) {
        let next = (1..self.header_filled)
            .find(|&i| self.header_buf[i] == TETHER_MAGIC[0])
            .unwrap_or(self.header_filled);
        self.header_buf.copy_within(next..self.header_filled, 0);
        self.header_filled -= next;
        self.discarded += next as u64;
    }

    fn begin(&mut self, header: EnvelopeHeader, out: &mut Vec<Received>) -> ParseState {
        if header.kind == EnvelopeKind::FileChunk
            && !header.is_encrypted()
            && self.transfer.is_some()
        {
            return if header.payload_len == 0 {
                ParseState::AwaitingHeader
            } else {
                ParseState::StreamingFile {
                    header,
                    remaining: header.payload_len,
                }
            };
        }

        if header.payload_len == 0 {
            return self.complete(header, Bytes::new(), out);
        }
        ParseState::AccumulatingBody {
            header,
            body: BytesMut::with_capacity(header.payload_len as usize),
        }
    }

    fn complete(
        &mut self,
        header: EnvelopeHeader,
        body: Bytes,
        out: &mut Vec<Received>,
    ) -> ParseState {
        match header.kind {
            EnvelopeKind::Message | EnvelopeKind::Command | EnvelopeKind::Ack => {
                match open_payload(&header, body, self.cipher.as_deref()) {
                    Ok(payload) => {
                        out.push(Received::Envelope(Envelope { header, payload }));
                        ParseState::AwaitingHeader
                    }
                    Err(error) => ParseState::Faulted {
                        error,
                        resync: false,
                    },
                }
            }

            EnvelopeKind::FileStart => {
                let meta = open_payload(&header, body, self.cipher.as_deref()).and_then(|p| {
                    serde_json::from_slice::<FileMeta>(&p)
                        .map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))
                });
                match meta {
                    Ok(meta) => {
                        if self.transfer.is_some() {
                            debug!("File start for {:?} replaces an unfinished transfer", meta.path);
                        }
                        self.transfer = Some(InboundTransfer {
                            total: meta.size,
                            received: 0,
                            skipping: false,
                        });
                        out.push(Received::FileStart { header, meta });
                        ParseState::AwaitingHeader
                    }
                    Err(error) => ParseState::Faulted {
                        error,
                        resync: false,
                    },
                }
            }

            EnvelopeKind::FileChunk => {
                let skipping = match &self.transfer {
                    Some(transfer) => transfer.skipping,
                    None => {
                        return ParseState::Faulted {
                            error: ProtocolError::UnexpectedEnvelope(header.kind),
                            resync: false,
                        }
                    }
                };
                if skipping {
                    return ParseState::AwaitingHeader;
                }
                match open_payload(&header, body, self.cipher.as_deref()) {
                    Ok(chunk) => {
                        self.stream_chunk(chunk, out);
                        ParseState::AwaitingHeader
                    }
                    Err(error) => ParseState::Faulted {
                        error,
                        resync: false,
                    },
                }
            }

            EnvelopeKind::FileEnd => match self.transfer.take() {
                Some(transfer) => {
                    if !transfer.skipping {
                        out.push(Received::FileEnd);
                    }
                    ParseState::AwaitingHeader
                }
                None => ParseState::Faulted {
                    error: ProtocolError::UnexpectedEnvelope(header.kind),
                    resync: false,
                },
            },
        }
    }

    fn stream_chunk(&mut self, chunk: Bytes, out: &mut Vec<Received>) {
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.received += chunk.len() as u64;
            if !transfer.skipping && !chunk.is_empty() {
                out.push(Received::FileData(chunk));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChaChaCipher;
    use crate::envelope::encode_envelope;
    use rand::{Rng, SeedableRng};

    fn wire(kind: EnvelopeKind, payload: &[u8]) -> Vec<u8> {
        encode_envelope(kind, payload, false, None).unwrap().to_vec()
    }

    fn sealed(kind: EnvelopeKind, payload: &[u8], cipher: &ChaChaCipher) -> Vec<u8> {
        encode_envelope(kind, payload, true, Some(cipher)).unwrap().to_vec()
    }

    fn file_start(path: &str, size: u64) -> Vec<u8> {
        let meta = serde_json::to_vec(&FileMeta {
            path: path.into(),
            size,
        })
        .unwrap();
        wire(EnvelopeKind::FileStart, &meta)
    }

    fn feed_all(machine: &mut ReceiveMachine, chunks: &[&[u8]]) -> Vec<Received> {
        let mut out = Vec::new();
        for chunk in chunks {
            machine.feed(chunk, &mut out);
        }
        out
    }

    fn random_split(bytes: &[u8], rng: &mut impl Rng) -> Vec<Vec<u8>> {
        let mut parts = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            let n = rng.gen_range(1..=rest.len().min(40));
            parts.push(rest[..n].to_vec());
            rest = &rest[n..];
        }
        parts
    }

    fn file_bytes(out: &[Received]) -> Vec<u8> {
        out.iter()
            .filter_map(|r| match r {
                Received::FileData(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn single_read_single_envelope() {
        let mut machine = ReceiveMachine::new(1024, None);
        let out = feed_all(&mut machine, &[&wire(EnvelopeKind::Message, b"hello")]);

        assert_eq!(out.len(), 1);
        match &out[0] {
            Received::Envelope(env) => {
                assert_eq!(env.kind(), EnvelopeKind::Message);
                assert_eq!(&env.payload[..], b"hello");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(machine.state().name(), "AwaitingHeader");
    }

    #[test]
    fn any_split_yields_one_envelope() {
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        let bytes = wire(EnvelopeKind::Command, &payload);
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x7e7);

        for _ in 0..200 {
            let mut machine = ReceiveMachine::new(1024, None);
            let mut out = Vec::new();
            for part in random_split(&bytes, &mut rng) {
                machine.feed(&part, &mut out);
            }
            assert_eq!(out.len(), 1);
            assert!(matches!(&out[0], Received::Envelope(env) if env.payload[..] == payload[..]));
        }
    }

    #[test]
    fn byte_at_a_time_encrypted() {
        let cipher = ChaChaCipher::from_passphrase("split");
        let shared: Arc<dyn PayloadCipher> = Arc::new(ChaChaCipher::from_passphrase("split"));
        let bytes = sealed(EnvelopeKind::Message, b"sealed text", &cipher);

        let mut machine = ReceiveMachine::new(1024, Some(shared));
        let mut out = Vec::new();
        for b in &bytes {
            machine.feed(std::slice::from_ref(b), &mut out);
        }
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Received::Envelope(env) if env.text() == "sealed text"));
    }

    #[test]
    fn several_envelopes_in_one_read() {
        let mut bytes = wire(EnvelopeKind::Message, b"a");
        bytes.extend(wire(EnvelopeKind::Ack, b""));
        bytes.extend(wire(EnvelopeKind::Command, b"c"));

        let mut machine = ReceiveMachine::new(1024, None);
        let out = feed_all(&mut machine, &[&bytes]);
        let kinds: Vec<_> = out
            .iter()
            .map(|r| match r {
                Received::Envelope(env) => env.kind(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![EnvelopeKind::Message, EnvelopeKind::Ack, EnvelopeKind::Command]
        );
    }

    #[test]
    fn short_reads_never_fault() {
        let bytes = wire(EnvelopeKind::Message, &[9u8; 64]);
        let mut machine = ReceiveMachine::new(1024, None);
        let mut out = Vec::new();

        machine.feed(&bytes[..HEADER_LEN + 10], &mut out);
        assert!(out.is_empty());
        assert_eq!(machine.state().name(), "AccumulatingBody");

        machine.feed(&bytes[HEADER_LEN + 10..HEADER_LEN + 11], &mut out);
        assert!(out.is_empty());

        machine.feed(&bytes[HEADER_LEN + 11..], &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn garbage_then_valid_envelope_recovers() {
        let mut bytes = b"\x00garbage TH\x01 not a header".to_vec();
        bytes.extend(wire(EnvelopeKind::Message, b"after"));

        let mut machine = ReceiveMachine::new(1024, None);
        let out = feed_all(&mut machine, &[&bytes]);

        assert_eq!(out.len(), 2, "{:?}", out);
        assert!(matches!(&out[0], Received::Fault(_)));
        assert!(matches!(&out[1], Received::Envelope(env) if env.text() == "after"));
        assert!(machine.discarded_bytes() > 0);
    }

    #[test]
    fn recovery_across_reads() {
        let mut machine = ReceiveMachine::new(1024, None);
        let mut out = Vec::new();

        let mut corrupt = wire(EnvelopeKind::Message, b"lost");
        corrupt[7] ^= 0x55;
        machine.feed(&corrupt, &mut out);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Received::Fault(ProtocolError::HeaderChecksum { .. })));

        let good = wire(EnvelopeKind::Command, b"next");
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        for part in random_split(&good, &mut rng) {
            machine.feed(&part, &mut out);
        }
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], Received::Envelope(env) if env.text() == "next"));
    }

    #[test]
    fn decrypt_failure_drops_only_that_envelope() {
        let sender = ChaChaCipher::from_passphrase("sender");
        let receiver: Arc<dyn PayloadCipher> = Arc::new(ChaChaCipher::from_passphrase("other"));

        let mut bytes = sealed(EnvelopeKind::Message, b"unreadable", &sender);
        bytes.extend(wire(EnvelopeKind::Message, b"plain"));

        let mut machine = ReceiveMachine::new(1024, Some(receiver));
        let out = feed_all(&mut machine, &[&bytes]);
        assert_eq!(
            out[0],
            Received::Fault(ProtocolError::Decrypt(EnvelopeKind::Message))
        );
        assert!(matches!(&out[1], Received::Envelope(env) if env.text() == "plain"));
    }

    #[test]
    fn encrypted_without_cipher_faults() {
        let cipher = ChaChaCipher::from_passphrase("x");
        let mut machine = ReceiveMachine::new(1024, None);
        let out = feed_all(&mut machine, &[&sealed(EnvelopeKind::Command, b"c", &cipher)]);
        assert_eq!(
            out,
            vec![Received::Fault(ProtocolError::MissingCipher(EnvelopeKind::Command))]
        );
    }

    #[test]
    fn oversized_declaration_is_a_fault() {
        let mut bytes = wire(EnvelopeKind::Message, &[0u8; 100]);
        bytes.extend(wire(EnvelopeKind::Message, b"ok"));

        // The oversized body is scanned byte-wise for a new header
        let mut machine = ReceiveMachine::new(50, None);
        let out = feed_all(&mut machine, &[&bytes]);
        assert!(matches!(
            out[0],
            Received::Fault(ProtocolError::PayloadTooLarge { len: 100, max: 50 })
        ));
        assert!(matches!(out.last(), Some(Received::Envelope(env)) if env.text() == "ok"));
    }

    #[test]
    fn stray_chunk_and_end_fault() {
        let mut bytes = wire(EnvelopeKind::FileChunk, b"orphan");
        bytes.extend(wire(EnvelopeKind::FileEnd, b""));
        bytes.extend(wire(EnvelopeKind::Message, b"still here"));

        let mut machine = ReceiveMachine::new(1024, None);
        let out = feed_all(&mut machine, &[&bytes]);
        assert_eq!(
            out[..2],
            [
                Received::Fault(ProtocolError::UnexpectedEnvelope(EnvelopeKind::FileChunk)),
                Received::Fault(ProtocolError::UnexpectedEnvelope(EnvelopeKind::FileEnd)),
            ]
        );
        assert!(matches!(&out[2], Received::Envelope(env) if env.text() == "still here"));
    }

    #[test]
    fn bad_metadata_faults() {
        let mut machine = ReceiveMachine::new(1024, None);
        let out = feed_all(&mut machine, &[&wire(EnvelopeKind::FileStart, b"{not json")]);
        assert!(matches!(
            out[0],
            Received::Fault(ProtocolError::InvalidMetadata(_))
        ));
        assert!(!machine.transfer_active());
    }

    #[test]
    fn plain_file_streams_without_buffering() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 253) as u8).collect();
        let mut bytes = file_start("dir/f.bin", data.len() as u64);
        for chunk in data.chunks(256) {
            bytes.extend(wire(EnvelopeKind::FileChunk, chunk));
        }
        bytes.extend(wire(EnvelopeKind::FileEnd, b""));

        let mut machine = ReceiveMachine::new(1024, None);
        let mut out = Vec::new();
        let mut saw_streaming = false;
        for piece in bytes.chunks(37) {
            machine.feed(piece, &mut out);
            saw_streaming |= machine.state().name() == "StreamingFile";
        }
        assert!(saw_streaming);

        assert!(matches!(
            &out[0],
            Received::FileStart { meta, .. } if meta.path == "dir/f.bin" && meta.size == 1000
        ));
        assert_eq!(out.last(), Some(&Received::FileEnd));
        assert_eq!(file_bytes(&out), data);
        assert!(!machine.transfer_active());
    }

    #[test]
    fn encrypted_file_chunks_are_opened() {
        let cipher = ChaChaCipher::from_passphrase("files");
        let shared: Arc<dyn PayloadCipher> = Arc::new(ChaChaCipher::from_passphrase("files"));
        let data = vec![0xabu8; 700];

        let meta = serde_json::to_vec(&FileMeta {
            path: "secret.bin".into(),
            size: 700,
        })
        .unwrap();
        let mut bytes = sealed(EnvelopeKind::FileStart, &meta, &cipher);
        for chunk in data.chunks(300) {
            bytes.extend(sealed(EnvelopeKind::FileChunk, chunk, &cipher));
        }
        bytes.extend(wire(EnvelopeKind::FileEnd, b""));

        let mut machine = ReceiveMachine::new(4096, Some(shared));
        let mut out = Vec::new();
        for piece in bytes.chunks(64) {
            machine.feed(piece, &mut out);
            if machine.transfer_active() {
                let (received, total) = machine.transfer_progress().unwrap();
                assert!(received <= total);
            }
        }
        assert_eq!(file_bytes(&out), data);
        assert_eq!(out.last(), Some(&Received::FileEnd));
    }

    #[test]
    fn aborted_transfer_is_swallowed() {
        let mut bytes = file_start("x", 8);
        bytes.extend(wire(EnvelopeKind::FileChunk, b"1234"));

        let mut machine = ReceiveMachine::new(1024, None);
        let mut out = feed_all(&mut machine, &[&bytes]);
        assert_eq!(out.len(), 2);
        machine.abort_transfer();

        let mut rest = wire(EnvelopeKind::FileChunk, b"5678");
        rest.extend(wire(EnvelopeKind::FileEnd, b""));
        rest.extend(wire(EnvelopeKind::Message, b"m"));
        machine.feed(&rest, &mut out);

        assert_eq!(out.len(), 3);
        assert!(matches!(&out[2], Received::Envelope(env) if env.text() == "m"));
        assert!(!machine.transfer_active());
    }

    #[test]
    fn messages_interleave_with_transfer() {
        let mut bytes = file_start("f", 4);
        bytes.extend(wire(EnvelopeKind::FileChunk, b"ab"));
        bytes.extend(wire(EnvelopeKind::Message, b"between"));
        bytes.extend(wire(EnvelopeKind::FileChunk, b"cd"));
        bytes.extend(wire(EnvelopeKind::FileEnd, b""));

        let mut machine = ReceiveMachine::new(1024, None);
        let out = feed_all(&mut machine, &[&bytes]);
        assert!(out
            .iter()
            .any(|r| matches!(r, Received::Envelope(env) if env.text() == "between")));
        assert_eq!(file_bytes(&out), b"abcd");
    }

    #[test]
    fn reset_clears_partial_state() {
        let bytes = wire(EnvelopeKind::Message, b"partial");
        let mut machine = ReceiveMachine::new(1024, None);
        let mut out = Vec::new();
        machine.feed(&bytes[..HEADER_LEN + 2], &mut out);
        assert_eq!(machine.state().name(), "AccumulatingBody");

        machine.reset();
        machine.feed(&wire(EnvelopeKind::Message, b"fresh"), &mut out);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Received::Envelope(env) if env.text() == "fresh"));
    }
}
