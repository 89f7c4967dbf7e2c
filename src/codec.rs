//! `tokio-util` codec for whole envelopes.
//!
//! The send path writes through a `FramedWrite` with this codec. The decoder
//! buffers complete envelopes in memory and suits simple peers; connections
//! use the streaming [`ReceiveMachine`](crate::receive::ReceiveMachine)
//! instead so file chunks never have to be held in full.

use bytes::BytesMut;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

use crate::crypto::PayloadCipher;
use crate::envelope::{try_decode_envelope, write_envelope};
use crate::types::{Envelope, TetherError};

/// Default upper bound for a single declared payload (16 MiB)
pub const DEFAULT_MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_payload: u32,
    cipher: Option<Arc<dyn PayloadCipher>>,
}

impl EnvelopeCodec {
    pub fn new(max_payload: u32) -> Self {
        Self {
            max_payload,
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: Option<Arc<dyn PayloadCipher>>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        try_decode_envelope(src, self.max_payload, self.cipher.as_deref())
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = TetherError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_envelope(
            dst,
            item.header.kind,
            &item.payload,
            item.is_encrypted(),
            self.cipher.as_deref(),
            self.max_payload,
        )
    }
}
