//! Message bodies for discovery and connection setup.
//!
//! Each type knows how to write a complete message (header included) and
//! how to read its payload once the header has been parsed. Search request
//! frames are built incrementally by the search manager; the decoder here is
//! what a responder uses to read them.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::{
    get_address, get_array, get_size, get_string, get_u8, put_address, put_size, put_string,
    ByteOrder,
};
use crate::wire::{command, finish_message, start_message, WireError, FLAG_SERVER};

// ── Server GUID ──────────────────────────────────────────────────────────────

/// Identifies one run of a server. A new GUID at a known address means the
/// server restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerGuid(pub [u8; 12]);

impl fmt::Display for ServerGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ── Search request ───────────────────────────────────────────────────────────

/// A decoded CMD_SEARCH payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub sequence_id: u32,
    /// Unicast / reply-required bits.
    pub flags: u8,
    pub response_addr: SocketAddr,
    pub protocols: Vec<String>,
    /// (channel id, channel name) pairs.
    pub channels: Vec<(u32, String)>,
}

impl SearchRequest {
    /// Bytes of payload before the protocol list.
    pub const PREAMBLE_SIZE: usize = 4 + 1 + 3 + 16 + 2;

    pub fn decode(payload: &mut Bytes, order: ByteOrder) -> Result<Self, WireError> {
        let sequence_id = order.get_u32(payload)?;
        let flags = get_u8(payload)?;
        let _reserved: [u8; 3] = get_array(payload)?;
        let ip = get_address(payload)?;
        let port = order.get_u16(payload)?;

        let protocol_count = get_size(payload, order)?.unwrap_or(0);
        let mut protocols = Vec::with_capacity(protocol_count.min(8));
        for _ in 0..protocol_count {
            protocols.push(get_string(payload, order)?);
        }

        let count = order.get_u16(payload)? as usize;
        let mut channels = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let cid = order.get_u32(payload)?;
            channels.push((cid, get_string(payload, order)?));
        }

        Ok(Self {
            sequence_id,
            flags,
            response_addr: SocketAddr::new(ip, port),
            protocols,
            channels,
        })
    }
}

// ── Search response ──────────────────────────────────────────────────────────

/// CMD_SEARCH_RESPONSE: a server answering for some of the searched ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub guid: ServerGuid,
    pub sequence_id: u32,
    /// Where the server accepts TCP connections. An unspecified address
    /// means "the address this datagram came from".
    pub server_addr: SocketAddr,
    pub protocol: String,
    pub found: bool,
    pub channel_ids: Vec<u32>,
}

impl SearchResponse {
    pub fn encode(&self, buf: &mut BytesMut, order: ByteOrder) -> Result<(), WireError> {
        let count = u16::try_from(self.channel_ids.len())
            .map_err(|_| WireError::PayloadTooLarge(self.channel_ids.len()))?;
        let start = start_message(buf, command::SEARCH_RESPONSE, FLAG_SERVER, order);
        buf.put_slice(&self.guid.0);
        order.put_u32(buf, self.sequence_id);
        put_address(buf, self.server_addr.ip());
        order.put_u16(buf, self.server_addr.port());
        put_string(buf, order, &self.protocol);
        buf.put_u8(u8::from(self.found));
        order.put_u16(buf, count);
        for cid in &self.channel_ids {
            order.put_u32(buf, *cid);
        }
        finish_message(buf, start)
    }

    pub fn decode(payload: &mut Bytes, order: ByteOrder) -> Result<Self, WireError> {
        let guid = ServerGuid(get_array(payload)?);
        let sequence_id = order.get_u32(payload)?;
        let ip = get_address(payload)?;
        let port = order.get_u16(payload)?;
        let protocol = get_string(payload, order)?;
        let found = get_u8(payload)? != 0;
        let count = order.get_u16(payload)? as usize;
        let mut channel_ids = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            channel_ids.push(order.get_u32(payload)?);
        }
        Ok(Self {
            guid,
            sequence_id,
            server_addr: SocketAddr::new(ip, port),
            protocol,
            found,
            channel_ids,
        })
    }

    /// The TCP address to connect to, resolving an unspecified address
    /// against the datagram's source.
    pub fn resolved_server_addr(&self, source: IpAddr) -> SocketAddr {
        if crate::buffer::is_unspecified(self.server_addr.ip()) {
            SocketAddr::new(source, self.server_addr.port())
        } else {
            self.server_addr
        }
    }
}

// ── Beacon ───────────────────────────────────────────────────────────────────

/// CMD_BEACON: periodic server presence announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub guid: ServerGuid,
    pub flags: u8,
    pub sequence_id: u8,
    /// Bumped by the server whenever its channel set changes.
    pub change_count: u16,
    pub server_addr: SocketAddr,
    pub protocol: String,
}

impl Beacon {
    pub fn encode(&self, buf: &mut BytesMut, order: ByteOrder) -> Result<(), WireError> {
        let start = start_message(buf, command::BEACON, FLAG_SERVER, order);
        buf.put_slice(&self.guid.0);
        buf.put_u8(self.flags);
        buf.put_u8(self.sequence_id);
        order.put_u16(buf, self.change_count);
        put_address(buf, self.server_addr.ip());
        order.put_u16(buf, self.server_addr.port());
        put_string(buf, order, &self.protocol);
        // No server status structure.
        buf.put_u8(crate::introspection::NULL_TYPE_CODE);
        finish_message(buf, start)
    }

    /// Decode the fixed part of a beacon. A trailing status field is ignored.
    pub fn decode(payload: &mut Bytes, order: ByteOrder) -> Result<Self, WireError> {
        let guid = ServerGuid(get_array(payload)?);
        let flags = get_u8(payload)?;
        let sequence_id = get_u8(payload)?;
        let change_count = order.get_u16(payload)?;
        let ip = get_address(payload)?;
        let port = order.get_u16(payload)?;
        let protocol = get_string(payload, order)?;
        Ok(Self {
            guid,
            flags,
            sequence_id,
            change_count,
            server_addr: SocketAddr::new(ip, port),
            protocol,
        })
    }
}

// ── Connection validation ────────────────────────────────────────────────────

/// CMD_CONNECTION_VALIDATION body, in either direction.
///
/// The server sends its buffer sizes and the authentication methods it
/// offers; the client replies with its buffer sizes, the connection
/// priority and the method it picked. Authentication itself is opaque here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionValidation {
    pub receive_buffer_size: u32,
    pub socket_receive_buffer_size: u32,
    /// Present only in the client → server direction.
    pub priority: Option<i16>,
    pub auth_methods: Vec<String>,
}

impl ConnectionValidation {
    /// Write the full message. `from_server` selects the direction.
    pub fn encode(
        &self,
        buf: &mut BytesMut,
        order: ByteOrder,
        from_server: bool,
    ) -> Result<(), WireError> {
        let flags = if from_server { FLAG_SERVER } else { 0 };
        let start = start_message(buf, command::CONNECTION_VALIDATION, flags, order);
        order.put_u32(buf, self.receive_buffer_size);
        order.put_u32(buf, self.socket_receive_buffer_size);
        if from_server {
            put_size(buf, order, Some(self.auth_methods.len()));
            for method in &self.auth_methods {
                put_string(buf, order, method);
            }
        } else {
            order.put_i16(buf, self.priority.unwrap_or_default());
            put_string(buf, order, self.auth_methods.first().map_or("", String::as_str));
        }
        finish_message(buf, start)
    }

    /// Decode what a server sent us.
    pub fn decode_from_server(payload: &mut Bytes, order: ByteOrder) -> Result<Self, WireError> {
        let receive_buffer_size = order.get_u32(payload)?;
        let socket_receive_buffer_size = order.get_u32(payload)?;
        let mut auth_methods = Vec::new();
        if payload.has_remaining() {
            let count = get_size(payload, order)?.unwrap_or(0);
            for _ in 0..count {
                auth_methods.push(get_string(payload, order)?);
            }
        }
        Ok(Self { receive_buffer_size, socket_receive_buffer_size, priority: None, auth_methods })
    }

    /// Decode what a client replied.
    pub fn decode_from_client(payload: &mut Bytes, order: ByteOrder) -> Result<Self, WireError> {
        let receive_buffer_size = order.get_u32(payload)?;
        let socket_receive_buffer_size = order.get_u32(payload)?;
        let priority = order.get_i16(payload)?;
        let mut auth_methods = Vec::new();
        if payload.has_remaining() {
            let method = get_string(payload, order)?;
            if !method.is_empty() {
                auth_methods.push(method);
            }
        }
        Ok(Self {
            receive_buffer_size,
            socket_receive_buffer_size,
            priority: Some(priority),
            auth_methods,
        })
    }
}

/// Status byte meaning "no error".
pub const STATUS_OK: u8 = 0xFF;

/// CMD_CONNECTION_VALIDATED body: the server's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationStatus {
    Ok,
    Failed { kind: u8, message: String },
}

impl ValidationStatus {
    pub fn encode(&self, buf: &mut BytesMut, order: ByteOrder) -> Result<(), WireError> {
        let start = start_message(buf, command::CONNECTION_VALIDATED, FLAG_SERVER, order);
        match self {
            ValidationStatus::Ok => buf.put_u8(STATUS_OK),
            ValidationStatus::Failed { kind, message } => {
                buf.put_u8(*kind);
                put_string(buf, order, message);
                // empty call tree
                put_string(buf, order, "");
            }
        }
        finish_message(buf, start)
    }

    pub fn decode(payload: &mut Bytes, order: ByteOrder) -> Result<Self, WireError> {
        match get_u8(payload)? {
            STATUS_OK => Ok(ValidationStatus::Ok),
            kind => Ok(ValidationStatus::Failed { kind, message: get_string(payload, order)? }),
        }
    }
}
