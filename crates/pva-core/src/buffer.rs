//! Byte-order aware get/put primitives on top of `bytes`.
//!
//! PVA peers announce their byte order per message, so every multi-byte
//! read and write goes through a [`ByteOrder`]. Reads check the remaining
//! length first and report [`WireError::Truncated`] instead of panicking.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut};

use crate::wire::{WireError, FLAG_BIG_ENDIAN};

/// Size encodings at or above this value use the 5-byte long form.
const SIZE_LONG_FORM: u8 = 0xFE;
/// Encodes a null size (-1).
const SIZE_NULL: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    pub fn from_flags(flags: u8) -> Self {
        if flags & FLAG_BIG_ENDIAN != 0 {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// The header flag bit announcing this order.
    pub fn flag(self) -> u8 {
        match self {
            ByteOrder::Big => FLAG_BIG_ENDIAN,
            ByteOrder::Little => 0,
        }
    }

    pub fn put_i16(self, buf: &mut impl BufMut, v: i16) {
        match self {
            ByteOrder::Big => buf.put_i16(v),
            ByteOrder::Little => buf.put_i16_le(v),
        }
    }

    pub fn put_u16(self, buf: &mut impl BufMut, v: u16) {
        match self {
            ByteOrder::Big => buf.put_u16(v),
            ByteOrder::Little => buf.put_u16_le(v),
        }
    }

    pub fn put_i32(self, buf: &mut impl BufMut, v: i32) {
        match self {
            ByteOrder::Big => buf.put_i32(v),
            ByteOrder::Little => buf.put_i32_le(v),
        }
    }

    pub fn put_u32(self, buf: &mut impl BufMut, v: u32) {
        match self {
            ByteOrder::Big => buf.put_u32(v),
            ByteOrder::Little => buf.put_u32_le(v),
        }
    }

    pub fn get_i16(self, buf: &mut impl Buf) -> Result<i16, WireError> {
        ensure(&*buf, 2)?;
        Ok(match self {
            ByteOrder::Big => buf.get_i16(),
            ByteOrder::Little => buf.get_i16_le(),
        })
    }

    pub fn get_u16(self, buf: &mut impl Buf) -> Result<u16, WireError> {
        ensure(&*buf, 2)?;
        Ok(match self {
            ByteOrder::Big => buf.get_u16(),
            ByteOrder::Little => buf.get_u16_le(),
        })
    }

    pub fn get_i32(self, buf: &mut impl Buf) -> Result<i32, WireError> {
        ensure(&*buf, 4)?;
        Ok(match self {
            ByteOrder::Big => buf.get_i32(),
            ByteOrder::Little => buf.get_i32_le(),
        })
    }

    pub fn get_u32(self, buf: &mut impl Buf) -> Result<u32, WireError> {
        ensure(&*buf, 4)?;
        Ok(match self {
            ByteOrder::Big => buf.get_u32(),
            ByteOrder::Little => buf.get_u32_le(),
        })
    }
}

/// Fail unless `buf` has at least `n` bytes left.
pub fn ensure(buf: &impl Buf, n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::Truncated { needed: n, available: buf.remaining() });
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8, WireError> {
    ensure(&*buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_array<const N: usize>(buf: &mut impl Buf) -> Result<[u8; N], WireError> {
    ensure(&*buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

// ── Sizes and strings ────────────────────────────────────────────────────────

/// Write a size: one byte below 254, otherwise 0xFE followed by an int32.
/// `None` encodes null.
pub fn put_size(buf: &mut impl BufMut, order: ByteOrder, size: Option<usize>) {
    match size {
        None => buf.put_u8(SIZE_NULL),
        Some(n) if n < SIZE_LONG_FORM as usize => buf.put_u8(n as u8),
        Some(n) => {
            buf.put_u8(SIZE_LONG_FORM);
            order.put_i32(buf, i32::try_from(n).unwrap_or(i32::MAX));
        }
    }
}

pub fn get_size(buf: &mut impl Buf, order: ByteOrder) -> Result<Option<usize>, WireError> {
    match get_u8(buf)? {
        SIZE_NULL => Ok(None),
        SIZE_LONG_FORM => {
            let n = order.get_i32(buf)?;
            if n < 0 {
                return Err(WireError::NegativeSize(n));
            }
            Ok(Some(n as usize))
        }
        n => Ok(Some(n as usize)),
    }
}

/// Bytes [`put_size`] will use for `n`.
pub fn size_len(n: usize) -> usize {
    if n < SIZE_LONG_FORM as usize {
        1
    } else {
        5
    }
}

pub fn put_string(buf: &mut impl BufMut, order: ByteOrder, s: &str) {
    put_size(buf, order, Some(s.len()));
    buf.put_slice(s.as_bytes());
}

/// Read a string. A null string reads as empty.
pub fn get_string(buf: &mut impl Buf, order: ByteOrder) -> Result<String, WireError> {
    let Some(len) = get_size(buf, order)? else {
        return Ok(String::new());
    };
    ensure(&*buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
}

/// Bytes [`put_string`] will use for `s`.
pub fn string_len(s: &str) -> usize {
    size_len(s.len()) + s.len()
}

// ── Addresses ────────────────────────────────────────────────────────────────

/// Write an address as 16 bytes; IPv4 addresses are IPv6-mapped.
pub fn put_address(buf: &mut impl BufMut, addr: IpAddr) {
    let v6 = match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    buf.put_slice(&v6.octets());
}

/// Read a 16-byte address, unmapping IPv4-mapped addresses.
pub fn get_address(buf: &mut impl Buf) -> Result<IpAddr, WireError> {
    let octets: [u8; 16] = get_array(buf)?;
    let v6 = Ipv6Addr::from(octets);
    Ok(match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    })
}

/// True for the all-zero address, in either family.
pub fn is_unspecified(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4 == Ipv4Addr::UNSPECIFIED,
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}
