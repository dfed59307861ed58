//! Self-describing binary codec.
//!
//! Payloads carry their own structure: a tag byte per value, inline type
//! descriptors the first time an object type is seen, and back-references
//! for repeated instances. Typed structs plug in through [`Packet`] and the
//! [`wire_packet!`](crate::wire_packet) macro.

pub mod convert;
pub mod decoder;
pub mod encoder;
pub mod object;
pub mod typeinfo;
pub mod unit;
pub mod value;
pub mod wire;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use object::Packet;
pub use typeinfo::{TypeDescriptor, TypeTable};
pub use unit::Unit;
pub use value::{FromValue, ObjectValue, ToValue, Value};
pub use wire::{wire_hash, WireReader, WireWriter};
