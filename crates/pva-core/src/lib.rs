//! pva-core: wire format, codecs, introspection cache and configuration.
//! The transport crate and the daemon depend on this one.

pub mod buffer;
pub mod config;
pub mod field;
pub mod introspection;
pub mod message;
pub mod wire;

pub use buffer::ByteOrder;
pub use config::PvaConfig;
pub use introspection::{IdSpace, IntrospectionRegistry, TypeDescription};
pub use message::ServerGuid;
pub use wire::{MessageHeader, WireError};
