//! Envelope encoding and decoding

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc_any::CRCu16;
use std::borrow::Cow;

use crate::crypto::PayloadCipher;
use crate::types::{
    Envelope, EnvelopeHeader, EnvelopeKind, Flags, ProtocolError, Result, HEADER_LEN,
    TETHER_MAGIC, TETHER_VERSION,
};

/// CRC-16/ARC over the first nine header bytes
pub fn header_checksum(bytes: &[u8]) -> u16 {
    let mut crc = CRCu16::crc16();
    crc.digest(bytes);
    crc.get_crc()
}

/// Encode a header into its fixed wire layout
pub fn encode_header(header: &EnvelopeHeader) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..2].copy_from_slice(&TETHER_MAGIC);
    out[2] = TETHER_VERSION;
    out[3] = header.kind as u8;
    out[4] = header.flags.bits();
    BigEndian::write_u32(&mut out[5..9], header.payload_len);
    let crc = header_checksum(&out[..9]);
    BigEndian::write_u16(&mut out[9..11], crc);
    out
}

/// Decode a header from the front of `bytes`.
///
/// Returns `Ok(None)` when fewer than [`HEADER_LEN`] bytes are available.
pub fn decode_header(
    bytes: &[u8],
    max_payload: u32,
) -> std::result::Result<Option<EnvelopeHeader>, ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Ok(None);
    }
    let bytes = &bytes[..HEADER_LEN];

    if bytes[0..2] != TETHER_MAGIC {
        return Err(ProtocolError::BadMagic([bytes[0], bytes[1]]));
    }
    if bytes[2] != TETHER_VERSION {
        return Err(ProtocolError::UnsupportedVersion(bytes[2]));
    }

    let expected = BigEndian::read_u16(&bytes[9..11]);
    let actual = header_checksum(&bytes[..9]);
    if expected != actual {
        return Err(ProtocolError::HeaderChecksum { expected, actual });
    }

    let kind = EnvelopeKind::from_u8(bytes[3]).ok_or(ProtocolError::UnknownKind(bytes[3]))?;
    let flags = Flags::from_bits(bytes[4]).ok_or(ProtocolError::UnknownFlags(bytes[4]))?;
    let payload_len = BigEndian::read_u32(&bytes[5..9]);
    if payload_len > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            len: payload_len as u64,
            max: max_payload,
        });
    }

    Ok(Some(EnvelopeHeader {
        kind,
        flags,
        payload_len,
    }))
}

/// Append one envelope to `dst`, sealing the payload first when `encrypted`
pub fn write_envelope(
    dst: &mut BytesMut,
    kind: EnvelopeKind,
    payload: &[u8],
    encrypted: bool,
    cipher: Option<&dyn PayloadCipher>,
    max_payload: u32,
) -> Result<()> {
    let body: Cow<'_, [u8]> = if encrypted {
        let cipher = cipher.ok_or(ProtocolError::MissingCipher(kind))?;
        Cow::Owned(cipher.seal(payload)?)
    } else {
        Cow::Borrowed(payload)
    };

    let payload_len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= max_payload)
        .ok_or(ProtocolError::PayloadTooLarge {
            len: body.len() as u64,
            max: max_payload,
        })?;

    let header = EnvelopeHeader::new(kind, payload_len, encrypted);
    dst.reserve(HEADER_LEN + body.len());
    dst.put_slice(&encode_header(&header));
    dst.put_slice(&body);
    Ok(())
}

/// Encode a single envelope into a fresh buffer
pub fn encode_envelope(
    kind: EnvelopeKind,
    payload: &[u8],
    encrypted: bool,
    cipher: Option<&dyn PayloadCipher>,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    write_envelope(&mut buf, kind, payload, encrypted, cipher, u32::MAX)?;
    Ok(buf.freeze())
}

/// Try to decode one whole envelope from `buf`, consuming it on success.
///
/// Returns `Ok(None)` and leaves `buf` untouched until the header and the full
/// payload are buffered.
pub fn try_decode_envelope(
    buf: &mut BytesMut,
    max_payload: u32,
    cipher: Option<&dyn PayloadCipher>,
) -> Result<Option<Envelope>> {
    let header = match decode_header(&buf[..], max_payload)? {
        Some(header) => header,
        None => return Ok(None),
    };

    let total = HEADER_LEN + header.payload_len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let body = buf.split_to(header.payload_len as usize).freeze();
    let payload = open_payload(&header, body, cipher)?;
    Ok(Some(Envelope { header, payload }))
}

/// Decrypt a fully accumulated payload if the header says it is sealed
pub(crate) fn open_payload(
    header: &EnvelopeHeader,
    body: Bytes,
    cipher: Option<&dyn PayloadCipher>,
) -> std::result::Result<Bytes, ProtocolError> {
    if !header.is_encrypted() {
        return Ok(body);
    }
    let cipher = cipher.ok_or(ProtocolError::MissingCipher(header.kind))?;
    cipher
        .open(&body)
        .map(Bytes::from)
        .map_err(|_| ProtocolError::Decrypt(header.kind))
}
