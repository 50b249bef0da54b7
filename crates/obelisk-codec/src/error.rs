//! Error types for codec operations.

use thiserror::Error;

/// Convenience result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors that can occur while encoding or decoding values.
///
/// Every decode failure maps to a specific variant so callers can
/// distinguish a hostile or corrupted message from an internal bug.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Encountered a type tag that no known value kind uses.
    #[error("unknown value tag: 0x{tag:02x}")]
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
    },

    /// The input ended before the announced body length.
    #[error("truncated input: needed {needed} more bytes, {available} available")]
    Truncated {
        /// Bytes still required by the current header or body.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// Bytes remained after the outermost value was fully decoded.
    #[error("{count} trailing bytes after complete value")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// An announced length exceeds the codec's size limit.
    #[error("encoded value too large: {got} bytes exceeds limit of {max}")]
    TooLarge {
        /// The configured limit.
        max: usize,
        /// The announced size.
        got: usize,
    },

    /// Nesting depth exceeded the codec's limit.
    #[error("nesting depth exceeds limit of {max}")]
    TooDeep {
        /// The configured depth limit.
        max: usize,
    },

    /// A `Text` body was not valid UTF-8.
    #[error("text body is not valid UTF-8")]
    InvalidUtf8,

    /// A `Bool` body was not exactly `0x00` or `0x01`.
    #[error("invalid boolean byte: 0x{byte:02x}")]
    InvalidBool {
        /// The offending body byte.
        byte: u8,
    },

    /// A `U64` body was not exactly 8 bytes.
    #[error("invalid integer width: expected 8 bytes, got {got}")]
    InvalidIntegerWidth {
        /// The announced body length.
        got: usize,
    },

    /// A payload field list had the wrong number of fields.
    #[error("wrong field count: expected {expected}, got {got}")]
    FieldCount {
        /// Fields the message shape requires.
        expected: usize,
        /// Fields actually present.
        got: usize,
    },

    /// A payload field had the wrong type for its position.
    #[error("field {index} has wrong type: expected {expected}, got {got}")]
    FieldType {
        /// Zero-based field position.
        index: usize,
        /// The kind the message shape requires.
        expected: &'static str,
        /// The kind actually present.
        got: &'static str,
    },

    /// The payload was not the `List` every message shape requires.
    #[error("payload is not a field list (got {got})")]
    NotAList {
        /// The kind actually present.
        got: &'static str,
    },

    /// A message carried a tag its protocol does not define.
    ///
    /// Distinct from [`CodecError::UnknownTag`], which is a *value*
    /// type tag: this is the message-type tag of an envelope.
    #[error("unknown message tag: {tag}")]
    UnknownMessageTag {
        /// The unrecognized message-type tag.
        tag: u16,
    },
}
