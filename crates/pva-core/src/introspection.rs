//! Introspection registry: per-connection cache of type descriptions.
//!
//! Sending a full structure description with every message is wasteful, so
//! each connection keeps a table from small integer ids to descriptions it
//! has already exchanged. The first time a compound type crosses the wire it
//! goes out as FULL_WITH_ID; afterwards only its id is sent.
//!
//! Both peers write into the same per-connection table. To avoid collisions
//! without coordination, the client assigns ids upwards from 1 and the
//! server downwards from -1. A description the peer cached under its id can
//! be referenced back to it by that id.
//!
//! The registry must be [`reset`](IntrospectionRegistry::reset) whenever the
//! connection is re-established; stale ids would otherwise resolve to the
//! wrong type.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::{get_u8, ByteOrder};
use crate::wire::WireError;

/// Tag: no type description.
pub const NULL_TYPE_CODE: u8 = 0xFF;
/// Tag: reference to a cached description, followed by an int16 id.
pub const ONLY_ID_TYPE_CODE: u8 = 0xFE;
/// Tag: int16 id followed by the full description to cache under it.
pub const FULL_WITH_ID_TYPE_CODE: u8 = 0xFD;

/// A type description that can travel through the registry.
///
/// The registry only needs to know whether a description is worth caching
/// and how to encode it in full. Nested descriptions are encoded through
/// the registry again so they are cached too.
pub trait TypeDescription: Clone + Eq + Hash + Send + Sync + 'static {
    /// Structures and unions are cached; scalars and scalar arrays are not.
    fn is_compound(&self) -> bool;

    /// Write the full encoding, starting with the type code byte.
    fn encode_full(
        &self,
        buf: &mut BytesMut,
        order: ByteOrder,
        registry: &mut IntrospectionRegistry<Self>,
    ) -> Result<(), WireError>;

    /// Read a full encoding, starting with the type code byte.
    fn decode_full(
        buf: &mut Bytes,
        order: ByteOrder,
        registry: &mut IntrospectionRegistry<Self>,
    ) -> Result<Self, WireError>;
}

/// Which end of the id space this side of the connection assigns from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpace {
    /// 1, 2, 3, ... up to i16::MAX
    Client,
    /// -1, -2, -3, ... down to i16::MIN
    Server,
}

impl IdSpace {
    fn first(self) -> i16 {
        match self {
            IdSpace::Client => 1,
            IdSpace::Server => -1,
        }
    }

    fn after(self, id: i16) -> Option<i16> {
        match self {
            IdSpace::Client => id.checked_add(1),
            IdSpace::Server => id.checked_sub(1),
        }
    }

    fn owns(self, id: i16) -> bool {
        match self {
            IdSpace::Client => id > 0,
            IdSpace::Server => id < 0,
        }
    }
}

pub struct IntrospectionRegistry<T: TypeDescription> {
    space: IdSpace,
    /// Next id to hand out, `None` once the space is used up.
    next_id: Option<i16>,
    by_id: HashMap<i16, Arc<T>>,
    /// Structural lookup; the most recently cached id wins.
    by_type: HashMap<Arc<T>, i16>,
}

impl<T: TypeDescription> IntrospectionRegistry<T> {
    pub fn new(space: IdSpace) -> Self {
        Self {
            space,
            next_id: Some(space.first()),
            by_id: HashMap::new(),
            by_type: HashMap::new(),
        }
    }

    pub fn space(&self) -> IdSpace {
        self.space
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: i16) -> Option<Arc<T>> {
        self.by_id.get(&id).cloned()
    }

    /// Forget everything. Id assignment restarts from the beginning.
    pub fn reset(&mut self) {
        self.by_id.clear();
        self.by_type.clear();
        self.next_id = Some(self.space.first());
    }

    fn cache(&mut self, id: i16, field: Arc<T>) {
        if let Some(previous) = self.by_id.insert(id, field.clone()) {
            if self.by_type.get(&previous) == Some(&id) {
                self.by_type.remove(&previous);
            }
        }
        self.by_type.insert(field, id);
    }

    fn allocate_id(&mut self) -> Result<i16, WireError> {
        let id = self.next_id.ok_or(WireError::IntrospectionIdsExhausted)?;
        self.next_id = self.space.after(id);
        Ok(id)
    }

    /// Encode `field`, using the cache for compound types.
    pub fn serialize(
        &mut self,
        field: Option<&T>,
        buf: &mut BytesMut,
        order: ByteOrder,
    ) -> Result<(), WireError> {
        let Some(field) = field else {
            buf.put_u8(NULL_TYPE_CODE);
            return Ok(());
        };

        if !field.is_compound() {
            return field.encode_full(buf, order, self);
        }

        if let Some(&id) = self.by_type.get(field) {
            buf.put_u8(ONLY_ID_TYPE_CODE);
            order.put_i16(buf, id);
            return Ok(());
        }

        let id = self.allocate_id()?;
        buf.put_u8(FULL_WITH_ID_TYPE_CODE);
        order.put_i16(buf, id);
        field.encode_full(buf, order, self)?;
        self.cache(id, Arc::new(field.clone()));
        Ok(())
    }

    /// Decode one type description from `buf`.
    ///
    /// An ONLY_ID for an id we never cached means the peer and we disagree
    /// about the table contents; that error must close the connection.
    pub fn deserialize(
        &mut self,
        buf: &mut Bytes,
        order: ByteOrder,
    ) -> Result<Option<Arc<T>>, WireError> {
        if !buf.has_remaining() {
            return Err(WireError::Truncated { needed: 1, available: 0 });
        }

        match buf[0] {
            NULL_TYPE_CODE => {
                buf.advance(1);
                Ok(None)
            }
            ONLY_ID_TYPE_CODE => {
                buf.advance(1);
                let id = order.get_i16(buf)?;
                self.get(id).map(Some).ok_or(WireError::UnknownIntrospectionId(id))
            }
            FULL_WITH_ID_TYPE_CODE => {
                buf.advance(1);
                let id = order.get_i16(buf)?;
                if self.space.owns(id) {
                    return Err(WireError::IntrospectionIdCollision(id));
                }
                let field = Arc::new(T::decode_full(buf, order, self)?);
                self.cache(id, field.clone());
                Ok(Some(field))
            }
            // Raw, uncached encoding: the tag byte is the type code itself.
            _ => Ok(Some(Arc::new(T::decode_full(buf, order, self)?))),
        }
    }

    /// Like [`deserialize`](Self::deserialize) but a null is an error.
    pub fn deserialize_required(
        &mut self,
        buf: &mut Bytes,
        order: ByteOrder,
    ) -> Result<Arc<T>, WireError> {
        self.deserialize(buf, order)?.ok_or(WireError::NullField)
    }
}

/// Read the leading type code byte of a full encoding.
pub fn read_type_code(buf: &mut Bytes) -> Result<u8, WireError> {
    get_u8(buf)
}
