//! Wire Protocol
//!
//! Envelope codec and payload values. Pure transforms: no I/O, no clocks.

pub mod envelope;
pub mod value;

pub use envelope::{
    decode, encode, is_reserved_event, CodecError, ControlKind, ControlMessage, Envelope, Frame,
    FrameError, Meta, MetaKey, CONTROL_PREFIX,
};
pub use value::{BinaryKind, BinaryValue, Value};
