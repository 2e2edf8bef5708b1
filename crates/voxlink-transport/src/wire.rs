//! # Voxlink Wire Format
//!
//! Fixed 16-byte packet header followed by a stream-ciphered payload.
//! No trailer, no authentication tag, no padding.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |     Flags     |       Payload Length (16)     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Source Identifier (32)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Timestamp, Unix seconds (32)                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Sequence Number (32)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The raw header bytes double as the AES-CTR initialisation vector for the
//! payload that follows. Timestamp and sequence advance per direction, so a
//! header is never reused with the same key within a session.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use bytes::{Buf, BufMut, Bytes, BytesMut};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Fixed header size. Also the AES block / IV size, which is what lets the
/// header stand in for a nonce.
pub const HEADER_LEN: usize = 16;

/// Session key size (AES-128).
pub const KEY_LEN: usize = 16;

/// Packet type tag for media audio. The only type this client emits.
pub const PACKET_TYPE_AUDIO: u8 = 0x01;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Wire-level decode failures.
///
/// Note what is deliberately *not* here: there is no authentication tag, so a
/// corrupted payload decrypts to garbage instead of failing. Callers treat
/// the plaintext as possibly garbled rather than dropping the packet.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the fixed header.
    #[error("malformed packet: {len} bytes, need at least {HEADER_LEN}")]
    MalformedPacket { len: usize },
}

// ─── Packet Header ──────────────────────────────────────────────────────────

/// Decoded packet header — present on every Voxlink media packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type tag ([`PACKET_TYPE_AUDIO`] for everything we send).
    pub packet_type: u8,
    /// Reserved flags, currently always zero.
    pub flags: u8,
    /// Payload length as claimed by the sender.
    ///
    /// Advisory only: deployed peers put stale values here and the receiver
    /// side has never validated it against the actual datagram length.
    /// [`PacketCodec::open`] surfaces it unchanged and decrypts whatever
    /// bytes actually follow the header.
    pub payload_len: u16,
    /// SSRC-like source identifier, always zero in this protocol.
    pub ssrc: u32,
    /// Send time, Unix seconds truncated.
    pub timestamp: u32,
    /// Per-direction sequence number, wraps at 2^32.
    pub sequence: u32,
}

impl PacketHeader {
    /// Create a media-audio header with zeroed flags and source identifier.
    pub fn audio(payload_len: u16, timestamp: u32, sequence: u32) -> Self {
        PacketHeader {
            packet_type: PACKET_TYPE_AUDIO,
            flags: 0,
            payload_len,
            ssrc: 0,
            timestamp,
            sequence,
        }
    }

    /// Encode the header into a buffer. All multi-byte fields big-endian.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.packet_type);
        buf.put_u8(self.flags);
        buf.put_u16(self.payload_len);
        buf.put_u32(self.ssrc);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.sequence);
    }

    /// Raw header bytes — the per-packet cipher IV.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }

    /// Decode a header from a buffer. Returns `None` if fewer than 16 bytes
    /// remain. No field is rejected as invalid — the type and flag bytes are
    /// surfaced as-is.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < HEADER_LEN {
            return None;
        }
        Some(PacketHeader {
            packet_type: buf.get_u8(),
            flags: buf.get_u8(),
            payload_len: buf.get_u16(),
            ssrc: buf.get_u32(),
            timestamp: buf.get_u32(),
            sequence: buf.get_u32(),
        })
    }
}

// ─── Packet Codec ───────────────────────────────────────────────────────────

/// Seals and opens media packets for one session key.
///
/// AES-128 in counter mode, seeded with the 16 header bytes; the header
/// itself travels in the clear. The caller owns sequence assignment and must
/// never reuse a sequence number for a given key — see
/// `voxlink-client`'s outbound counter.
#[derive(Clone)]
pub struct PacketCodec {
    key: [u8; KEY_LEN],
}

impl PacketCodec {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        PacketCodec { key }
    }

    /// Build header ‖ ciphertext for one audio payload.
    pub fn seal(&self, payload: &[u8], sequence: u32, timestamp: u32) -> Bytes {
        let header = PacketHeader::audio(payload.len() as u16, timestamp, sequence);
        let iv = header.to_bytes();

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_slice(&iv);

        let mut body = payload.to_vec();
        self.keystream(&iv).apply_keystream(&mut body);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Parse the header and decrypt the remainder of a datagram.
    ///
    /// Fails only when the datagram cannot carry a header at all. The
    /// `payload_len` field is not checked against the actual body length
    /// (advisory-only, see [`PacketHeader::payload_len`]), and corruption is
    /// undetectable — the plaintext may be garbage.
    pub fn open(&self, datagram: &[u8]) -> Result<(PacketHeader, Bytes), WireError> {
        if datagram.len() < HEADER_LEN {
            return Err(WireError::MalformedPacket {
                len: datagram.len(),
            });
        }

        let mut iv = [0u8; HEADER_LEN];
        iv.copy_from_slice(&datagram[..HEADER_LEN]);
        let header = match PacketHeader::decode(&mut &datagram[..HEADER_LEN]) {
            Some(header) => header,
            None => {
                return Err(WireError::MalformedPacket {
                    len: datagram.len(),
                })
            }
        };

        let mut body = datagram[HEADER_LEN..].to_vec();
        self.keystream(&iv).apply_keystream(&mut body);
        Ok((header, Bytes::from(body)))
    }

    fn keystream(&self, iv: &[u8; HEADER_LEN]) -> Aes128Ctr {
        Aes128Ctr::new(&self.key.into(), iv.into())
    }
}

impl std::fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("PacketCodec").finish_non_exhaustive()
    }
}
