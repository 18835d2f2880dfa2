//! Minimal field descriptions: just enough of the PVA type system to
//! exercise the introspection cache.
//!
//! Type codes follow the PVA encoding: scalars in 0x00..0x60, bit 0x08
//! marks a variable-size array, 0x80 and up are compound types. Members of
//! structures and unions are written through the registry so nested
//! compound types are cached on their own.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::{get_size, get_string, put_size, put_string, ByteOrder};
use crate::introspection::{read_type_code, IntrospectionRegistry, TypeDescription};
use crate::wire::WireError;

const ARRAY_FLAG: u8 = 0x08;
const STRUCTURE: u8 = 0x80;
const UNION: u8 = 0x81;
const VARIANT: u8 = 0x82;
const STRUCTURE_ARRAY: u8 = 0x88;
const UNION_ARRAY: u8 = 0x89;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScalarType {
    Boolean = 0x00,
    Byte = 0x20,
    Short = 0x21,
    Int = 0x22,
    Long = 0x23,
    UByte = 0x24,
    UShort = 0x25,
    UInt = 0x26,
    ULong = 0x27,
    Float = 0x42,
    Double = 0x43,
    String = 0x60,
}

impl TryFrom<u8> for ScalarType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => ScalarType::Boolean,
            0x20 => ScalarType::Byte,
            0x21 => ScalarType::Short,
            0x22 => ScalarType::Int,
            0x23 => ScalarType::Long,
            0x24 => ScalarType::UByte,
            0x25 => ScalarType::UShort,
            0x26 => ScalarType::UInt,
            0x27 => ScalarType::ULong,
            0x42 => ScalarType::Float,
            0x43 => ScalarType::Double,
            0x60 => ScalarType::String,
            other => return Err(WireError::UnknownTypeCode(other)),
        })
    }
}

/// Named members of a structure or union, in declaration order.
pub type Members = Vec<(String, Arc<FieldDesc>)>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldDesc {
    Scalar(ScalarType),
    ScalarArray(ScalarType),
    Structure { id: String, members: Members },
    Union { id: String, members: Members },
    /// A union that can hold any type.
    Variant,
    StructureArray(Arc<FieldDesc>),
    UnionArray(Arc<FieldDesc>),
}

impl FieldDesc {
    pub fn structure(id: &str, members: Vec<(&str, FieldDesc)>) -> Self {
        FieldDesc::Structure { id: id.to_string(), members: owned(members) }
    }

    pub fn union(id: &str, members: Vec<(&str, FieldDesc)>) -> Self {
        FieldDesc::Union { id: id.to_string(), members: owned(members) }
    }

    pub fn type_code(&self) -> u8 {
        match self {
            FieldDesc::Scalar(t) => *t as u8,
            FieldDesc::ScalarArray(t) => *t as u8 | ARRAY_FLAG,
            FieldDesc::Structure { .. } => STRUCTURE,
            FieldDesc::Union { .. } => UNION,
            FieldDesc::Variant => VARIANT,
            FieldDesc::StructureArray(_) => STRUCTURE_ARRAY,
            FieldDesc::UnionArray(_) => UNION_ARRAY,
        }
    }
}

fn owned(members: Vec<(&str, FieldDesc)>) -> Members {
    members
        .into_iter()
        .map(|(name, field)| (name.to_string(), Arc::new(field)))
        .collect()
}

fn encode_members(
    id: &str,
    members: &Members,
    buf: &mut BytesMut,
    order: ByteOrder,
    registry: &mut IntrospectionRegistry<FieldDesc>,
) -> Result<(), WireError> {
    put_string(buf, order, id);
    put_size(buf, order, Some(members.len()));
    for (name, field) in members {
        put_string(buf, order, name);
        registry.serialize(Some(field.as_ref()), buf, order)?;
    }
    Ok(())
}

fn decode_members(
    buf: &mut Bytes,
    order: ByteOrder,
    registry: &mut IntrospectionRegistry<FieldDesc>,
) -> Result<(String, Members), WireError> {
    let id = get_string(buf, order)?;
    let count = get_size(buf, order)?.unwrap_or(0);
    // Each member needs at least a name size byte and a type code.
    crate::buffer::ensure(&*buf, count.saturating_mul(2))?;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        let name = get_string(buf, order)?;
        let field = registry.deserialize_required(buf, order)?;
        members.push((name, field));
    }
    Ok((id, members))
}

impl TypeDescription for FieldDesc {
    fn is_compound(&self) -> bool {
        matches!(
            self,
            FieldDesc::Structure { .. }
                | FieldDesc::Union { .. }
                | FieldDesc::StructureArray(_)
                | FieldDesc::UnionArray(_)
        )
    }

    fn encode_full(
        &self,
        buf: &mut BytesMut,
        order: ByteOrder,
        registry: &mut IntrospectionRegistry<Self>,
    ) -> Result<(), WireError> {
        buf.put_u8(self.type_code());
        match self {
            FieldDesc::Scalar(_) | FieldDesc::ScalarArray(_) | FieldDesc::Variant => Ok(()),
            FieldDesc::Structure { id, members } | FieldDesc::Union { id, members } => {
                encode_members(id, members, buf, order, registry)
            }
            FieldDesc::StructureArray(element) | FieldDesc::UnionArray(element) => {
                registry.serialize(Some(element.as_ref()), buf, order)
            }
        }
    }

    fn decode_full(
        buf: &mut Bytes,
        order: ByteOrder,
        registry: &mut IntrospectionRegistry<Self>,
    ) -> Result<Self, WireError> {
        let code = read_type_code(buf)?;
        match code {
            STRUCTURE => {
                let (id, members) = decode_members(buf, order, registry)?;
                Ok(FieldDesc::Structure { id, members })
            }
            UNION => {
                let (id, members) = decode_members(buf, order, registry)?;
                Ok(FieldDesc::Union { id, members })
            }
            VARIANT => Ok(FieldDesc::Variant),
            STRUCTURE_ARRAY => Ok(FieldDesc::StructureArray(
                registry.deserialize_required(buf, order)?,
            )),
            UNION_ARRAY => Ok(FieldDesc::UnionArray(registry.deserialize_required(buf, order)?)),
            code if code & ARRAY_FLAG != 0 => {
                Ok(FieldDesc::ScalarArray(ScalarType::try_from(code & !ARRAY_FLAG)?))
            }
            code => Ok(FieldDesc::Scalar(ScalarType::try_from(code)?)),
        }
    }
}
