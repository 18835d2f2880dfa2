//! Search frame builder.
//!
//! Layout after the 8-byte header:
//!   u32   sequence id
//!   u8    mask (0x80 unicast, 0x01 reply required)
//!   [3]   reserved
//!   [16]  response address, IPv4 mapped into IPv6
//!   u16   response port
//!   size  protocol count, then the protocol names
//!   u16   channel count
//!   then per channel: u32 id, string name
//!
//! The mask and the channel count are patched in place, so one encoded
//! frame can go out unicast and broadcast without rebuilding it.

use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};

use pva_core::buffer::{put_address, put_size, put_string, string_len};
use pva_core::wire::{
    command, finish_message, start_message, HEADER_SIZE, PROTOCOL_TCP, SEARCH_UNICAST,
};
use pva_core::ByteOrder;

const MASK_OFFSET: usize = HEADER_SIZE + 4;

pub struct SearchFrame {
    buf: BytesMut,
    order: ByteOrder,
    max_size: usize,
    response_addr: SocketAddr,
    count_offset: usize,
    count: u16,
}

impl SearchFrame {
    pub fn new(max_size: usize, order: ByteOrder, response_addr: SocketAddr) -> Self {
        let mut frame = Self {
            buf: BytesMut::with_capacity(max_size),
            order,
            max_size,
            response_addr,
            count_offset: 0,
            count: 0,
        };
        frame.reset(0);
        frame
    }

    /// Start over with a new sequence id and no channels.
    pub fn reset(&mut self, sequence_id: u32) {
        self.buf.clear();
        start_message(&mut self.buf, command::SEARCH, 0, self.order);
        self.order.put_u32(&mut self.buf, sequence_id);
        self.buf.put_u8(0);
        self.buf.put_slice(&[0; 3]);
        put_address(&mut self.buf, self.response_addr.ip());
        self.order.put_u16(&mut self.buf, self.response_addr.port());
        put_size(&mut self.buf, self.order, Some(1));
        put_string(&mut self.buf, self.order, PROTOCOL_TCP);
        self.count_offset = self.buf.len();
        self.order.put_u16(&mut self.buf, 0);
        self.count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    /// Append a channel. Returns false, leaving the frame unchanged, if it
    /// would not fit.
    pub fn try_add(&mut self, channel_id: u32, name: &str) -> bool {
        let needed = 4 + string_len(name);
        if self.count == u16::MAX || self.buf.len() + needed > self.max_size {
            return false;
        }
        self.order.put_u32(&mut self.buf, channel_id);
        put_string(&mut self.buf, self.order, name);
        self.count += 1;
        true
    }

    /// The encoded datagram, with the mask set for a unicast or broadcast
    /// destination.
    pub fn finish(&mut self, unicast: bool) -> &[u8] {
        let count = match self.order {
            ByteOrder::Big => self.count.to_be_bytes(),
            ByteOrder::Little => self.count.to_le_bytes(),
        };
        self.buf[self.count_offset..self.count_offset + 2].copy_from_slice(&count);
        self.buf[MASK_OFFSET] = if unicast { SEARCH_UNICAST } else { 0 };

        if let Err(e) = finish_message(&mut self.buf, 0) {
            tracing::warn!(error = %e, "search frame too large");
        }
        &self.buf
    }
}
