//! PVA wire format: the message header, command codes and protocol constants.
//!
//! Every PVA message, TCP or UDP, starts with an 8-byte [`MessageHeader`].
//! The header's flags byte announces the byte order of everything that
//! follows, including the header's own payload size, so the size is kept as
//! raw bytes and decoded through [`ByteOrder`].
//!
//! The header is #[repr(C, packed)] with zerocopy derives, so it can be
//! read from and written to a buffer without copying field by field.

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::buffer::ByteOrder;

// ── Message Header ───────────────────────────────────────────────────────────

/// Prefix of every PVA message.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageHeader {
    /// Always [`PVA_MAGIC`]. Anything else is a protocol violation.
    pub magic: u8,

    /// Protocol revision of the sender. Zero is never valid.
    pub version: u8,

    /// Bit flags:
    ///   bit    0: control message (payload size field carries data)
    ///   bits 4-5: segmentation (see [`segment`])
    ///   bit    6: sent by a server
    ///   bit    7: big-endian payload
    pub flags: u8,

    /// Command code, see [`command`] and [`control`].
    pub command: u8,

    /// Payload length in the byte order given by `flags`.
    pub payload_size: [u8; 4],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(MessageHeader, [u8; 8]);

impl MessageHeader {
    /// Build a header for a message about to be written. The payload size
    /// starts at zero and is patched by [`finish_message`].
    pub fn new(command: u8, flags: u8, order: ByteOrder) -> Self {
        Self {
            magic: PVA_MAGIC,
            version: PVA_VERSION,
            flags: (flags & !FLAG_BIG_ENDIAN) | order.flag(),
            command,
            payload_size: [0; 4],
        }
    }

    /// Parse and check a header from the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::read_from_prefix(bytes).ok_or(WireError::Truncated {
            needed: HEADER_SIZE,
            available: bytes.len(),
        })?;
        header.validate()?;
        Ok(header)
    }

    /// Reject headers that cannot belong to a PVA peer.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.magic != PVA_MAGIC {
            return Err(WireError::BadMagic(self.magic));
        }
        if self.version == 0 {
            return Err(WireError::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    pub fn byte_order(&self) -> ByteOrder {
        ByteOrder::from_flags(self.flags)
    }

    pub fn payload_size(&self) -> u32 {
        match self.byte_order() {
            ByteOrder::Big => u32::from_be_bytes(self.payload_size),
            ByteOrder::Little => u32::from_le_bytes(self.payload_size),
        }
    }

    pub fn set_payload_size(&mut self, size: u32) {
        self.payload_size = match self.byte_order() {
            ByteOrder::Big => size.to_be_bytes(),
            ByteOrder::Little => size.to_le_bytes(),
        };
    }

    pub fn is_control(&self) -> bool {
        self.flags & FLAG_CONTROL != 0
    }

    pub fn is_from_server(&self) -> bool {
        self.flags & FLAG_SERVER != 0
    }

    /// Segmentation bits, one of the [`segment`] constants.
    pub fn segment(&self) -> u8 {
        self.flags & segment::MASK
    }
}

/// Append a header for `command` to `buf` and return its offset, so the
/// payload size can be patched once the payload has been written.
pub fn start_message(buf: &mut BytesMut, command: u8, flags: u8, order: ByteOrder) -> usize {
    let start = buf.len();
    buf.put_slice(MessageHeader::new(command, flags, order).as_bytes());
    start
}

/// Patch the payload size of the message whose header starts at `start`.
pub fn finish_message(buf: &mut BytesMut, start: usize) -> Result<(), WireError> {
    let payload = buf.len() - start - HEADER_SIZE;
    let size = u32::try_from(payload).map_err(|_| WireError::PayloadTooLarge(payload))?;
    let mut header = MessageHeader::read_from_prefix(&buf[start..])
        .ok_or(WireError::Truncated { needed: HEADER_SIZE, available: buf.len() - start })?;
    header.set_payload_size(size);
    buf[start..start + HEADER_SIZE].copy_from_slice(header.as_bytes());
    Ok(())
}

// ── Flags ────────────────────────────────────────────────────────────────────

pub const FLAG_CONTROL: u8 = 0x01;
pub const FLAG_SERVER: u8 = 0x40;
pub const FLAG_BIG_ENDIAN: u8 = 0x80;

/// Segmentation bits of the header flags.
pub mod segment {
    pub const MASK: u8 = 0x30;
    pub const NONE: u8 = 0x00;
    pub const FIRST: u8 = 0x10;
    pub const LAST: u8 = 0x20;
    pub const MIDDLE: u8 = 0x30;
}

// ── Commands ─────────────────────────────────────────────────────────────────

/// Application command codes (control flag clear).
pub mod command {
    pub const BEACON: u8 = 0;
    pub const CONNECTION_VALIDATION: u8 = 1;
    pub const ECHO: u8 = 2;
    pub const SEARCH: u8 = 3;
    pub const SEARCH_RESPONSE: u8 = 4;
    pub const AUTHNZ: u8 = 5;
    pub const ACL_CHANGE: u8 = 6;
    pub const CREATE_CHANNEL: u8 = 7;
    pub const DESTROY_CHANNEL: u8 = 8;
    pub const CONNECTION_VALIDATED: u8 = 9;
}

/// Control command codes (control flag set, no payload).
pub mod control {
    pub const SET_MARKER: u8 = 0;
    pub const ACK_MARKER: u8 = 1;
    pub const SET_ENDIANESS: u8 = 2;
}

// ── Constants ────────────────────────────────────────────────────────────────

pub const PVA_MAGIC: u8 = 0xCA;

/// Protocol revision we speak.
pub const PVA_VERSION: u8 = 2;

pub const HEADER_SIZE: usize = 8;

/// Default TCP port servers accept connections on.
pub const DEFAULT_SERVER_PORT: u16 = 5075;

/// Default UDP port for search requests and beacons.
pub const DEFAULT_BROADCAST_PORT: u16 = 5076;

/// Largest UDP datagram we send. Keeps search frames under a typical MTU.
pub const MAX_UDP_UNFRAGMENTED_SEND: usize = 1440;

/// Receive buffer for UDP datagrams.
pub const MAX_UDP_RECV: usize = 65_487;

/// Default application receive buffer advertised during validation.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: u32 = 16_384;

/// Search mask bit: the frame was sent unicast.
pub const SEARCH_UNICAST: u8 = 0x80;

/// Search mask bit: a reply is required even for channels the server lacks.
pub const SEARCH_REPLY_REQUIRED: u8 = 0x01;

/// The only transport protocol announced in search and beacon messages.
pub const PROTOCOL_TCP: &str = "tcp";

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad magic byte: 0x{0:02x}")]
    BadMagic(u8),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("buffer truncated: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("payload length {0} exceeds the wire limit")]
    PayloadTooLarge(usize),

    #[error("negative size encoding: {0}")]
    NegativeSize(i32),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unexpected command {0} for this message")]
    UnexpectedCommand(u8),

    #[error("unknown type code: 0x{0:02x}")]
    UnknownTypeCode(u8),

    #[error("introspection id {0} was never cached, peer is out of sync")]
    UnknownIntrospectionId(i16),

    #[error("introspection id {0} belongs to our own id space")]
    IntrospectionIdCollision(i16),

    #[error("introspection id space exhausted")]
    IntrospectionIdsExhausted,

    #[error("null field where a type description is required")]
    NullField,

    #[error("segment flags 0x{0:02x} out of sequence")]
    SegmentOutOfOrder(u8),
}

// ── Tests ────────────────────────────────────────────────────────────────────
