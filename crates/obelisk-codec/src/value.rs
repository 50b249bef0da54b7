//! The typed value tree and its binary wire form.
//!
//! ## Wire Format
//!
//! Every value is a header followed by a body:
//!
//! ```text
//! +-----+----------------+------------------+
//! | tag | length (u32 BE)| body             |
//! +-----+----------------+------------------+
//! ```
//!
//! | Tag  | Kind  | Body                                  |
//! |------|-------|---------------------------------------|
//! | 0x00 | Bytes | raw bytes                             |
//! | 0x01 | Text  | UTF-8 bytes                           |
//! | 0x02 | U64   | exactly 8 bytes, big-endian           |
//! | 0x03 | Bool  | exactly one byte, `0x00` or `0x01`    |
//! | 0x04 | List  | concatenation of encoded elements     |
//!
//! Field order inside a `List` is significant and fixed per message
//! tag. Decoding is strict: see [`decode`].

use crate::error::{CodecError, Result};
use crate::limits::{HEADER_SIZE, MAX_ENCODED_SIZE, MAX_NESTING_DEPTH};

const TAG_BYTES: u8 = 0x00;
const TAG_TEXT: u8 = 0x01;
const TAG_U64: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_LIST: u8 = 0x04;

/// A typed value in a protocol message payload.
///
/// Values are immutable once constructed; payloads are built as
/// `Value::List`s with a fixed field order per message tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// An opaque byte string (keys, identifiers, nested ciphertexts).
    Bytes(Vec<u8>),
    /// A UTF-8 string (URLs, external user ids, client ids).
    Text(String),
    /// An unsigned 64-bit integer.
    U64(u64),
    /// A boolean flag.
    Bool(bool),
    /// An ordered sequence of values.
    List(Vec<Value>),
}

impl Value {
    /// A short name for this value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::U64(_) => "u64",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
        }
    }

    /// Borrow the byte string, if this is a `Bytes` value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the string, if this is a `Text` value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Extract the integer, if this is a `U64` value.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(n) => Some(*n),
            _ => None,
        }
    }

    /// Extract the flag, if this is a `Bool` value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow the elements, if this is a `List` value.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Bytes(_) => TAG_BYTES,
            Value::Text(_) => TAG_TEXT,
            Value::U64(_) => TAG_U64,
            Value::Bool(_) => TAG_BOOL,
            Value::List(_) => TAG_LIST,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Value::Bytes(b) => b.len(),
            Value::Text(s) => s.len(),
            Value::U64(_) => 8,
            Value::Bool(_) => 1,
            Value::List(items) => items.iter().map(|v| HEADER_SIZE + v.body_len()).sum(),
        }
    }
}

/// Encode a value to its binary wire form.
///
/// Encoding is a pure transform and cannot fail.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + value.body_len());
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    out.push(value.tag());
    out.extend_from_slice(&(value.body_len() as u32).to_be_bytes());
    match value {
        Value::Bytes(b) => out.extend_from_slice(b),
        Value::Text(s) => out.extend_from_slice(s.as_bytes()),
        Value::U64(n) => out.extend_from_slice(&n.to_be_bytes()),
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::List(items) => {
            for item in items {
                encode_into(item, out);
            }
        }
    }
}

/// Decode a value from its binary wire form.
///
/// Decoding is strict: the input must contain exactly one well-formed
/// value and nothing else.
///
/// # Errors
///
/// Returns a [`CodecError`] if the input is oversized, truncated,
/// carries an unknown tag, nests too deeply, contains an invalid
/// `Bool`/`U64`/`Text` body, or has trailing bytes.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    if bytes.len() > MAX_ENCODED_SIZE {
        return Err(CodecError::TooLarge {
            max: MAX_ENCODED_SIZE,
            got: bytes.len(),
        });
    }
    let (value, consumed) = decode_one(bytes, 0)?;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes {
            count: bytes.len() - consumed,
        });
    }
    Ok(value)
}

/// Decode one value from the front of `bytes`, returning it together
/// with the number of bytes consumed.
fn decode_one(bytes: &[u8], depth: usize) -> Result<(Value, usize)> {
    if depth > MAX_NESTING_DEPTH {
        return Err(CodecError::TooDeep {
            max: MAX_NESTING_DEPTH,
        });
    }
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: HEADER_SIZE - bytes.len(),
            available: bytes.len(),
        });
    }
    let tag = bytes[0];
    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if len > MAX_ENCODED_SIZE {
        return Err(CodecError::TooLarge {
            max: MAX_ENCODED_SIZE,
            got: len,
        });
    }
    let remaining = &bytes[HEADER_SIZE..];
    if remaining.len() < len {
        return Err(CodecError::Truncated {
            needed: len - remaining.len(),
            available: remaining.len(),
        });
    }
    let body = &remaining[..len];

    let value = match tag {
        TAG_BYTES => Value::Bytes(body.to_vec()),
        TAG_TEXT => {
            let text = std::str::from_utf8(body).map_err(|_| CodecError::InvalidUtf8)?;
            Value::Text(text.to_owned())
        }
        TAG_U64 => {
            if body.len() != 8 {
                return Err(CodecError::InvalidIntegerWidth { got: body.len() });
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(body);
            Value::U64(u64::from_be_bytes(buf))
        }
        TAG_BOOL => match body {
            [0x00] => Value::Bool(false),
            [0x01] => Value::Bool(true),
            [byte] => return Err(CodecError::InvalidBool { byte: *byte }),
            _ => {
                return Err(CodecError::InvalidIntegerWidth { got: body.len() });
            }
        },
        TAG_LIST => {
            let mut items = Vec::new();
            let mut offset = 0;
            while offset < body.len() {
                let (item, used) = decode_one(&body[offset..], depth + 1)?;
                items.push(item);
                offset += used;
            }
            Value::List(items)
        }
        other => return Err(CodecError::UnknownTag { tag: other }),
    };

    Ok((value, HEADER_SIZE + len))
}
