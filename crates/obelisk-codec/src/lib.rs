//! # obelisk-codec
//!
//! Strict typed binary codec for Obelisk protocol messages.
//!
//! Every protocol message payload is a [`Value`] tree — typically a
//! `Value::List` whose elements appear in a fixed order that is part of
//! the wire contract for the message's tag. Changing the field list of
//! a message requires a new message tag, never an in-place
//! reinterpretation of the old one.
//!
//! ## Strictness
//!
//! Payloads arrive from untrusted network peers, so decoding is the
//! main attack-surface hardening point:
//!
//! - Unknown type tags, truncated bodies, oversized lengths, over-deep
//!   nesting and trailing bytes are all rejected with a specific
//!   [`CodecError`] variant.
//! - Field extraction via [`FieldReader`] requires the exact expected
//!   field count; a wrong count is [`CodecError::FieldCount`], never a
//!   panic or a silently ignored extra field.
//! - Optional fields are encoded as an explicit stand-in (the empty
//!   `Text`), never by omission, because field positions are fixed.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod encodable;
pub mod error;
pub mod limits;
pub mod value;

#[cfg(test)]
mod proptests;

pub use encodable::{
    decode_optional_bytes, decode_optional_text, optional_bytes, optional_text, Encodable,
    FieldReader,
};
pub use error::{CodecError, Result};
pub use value::{decode, encode, Value};
