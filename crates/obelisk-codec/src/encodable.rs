//! Conversions between payload field types and [`Value`] trees.
//!
//! Message definitions encode their fields in a fixed order and read
//! them back through a [`FieldReader`], which enforces the exact field
//! count and per-position types the message shape requires.

use crate::error::{CodecError, Result};
use crate::value::Value;

/// A type that can appear as a payload field.
pub trait Encodable: Sized {
    /// Convert this field to its value representation.
    fn to_value(&self) -> Value;

    /// Reconstruct this field from its value representation.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the value has the wrong kind or an
    /// invalid body for this type.
    fn from_value(value: &Value) -> Result<Self>;
}

impl Encodable for Vec<u8> {
    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }

    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or(CodecError::FieldType {
                index: 0,
                expected: "bytes",
                got: value.kind(),
            })
    }
}

impl Encodable for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_text()
            .map(str::to_owned)
            .ok_or(CodecError::FieldType {
                index: 0,
                expected: "text",
                got: value.kind(),
            })
    }
}

impl Encodable for u64 {
    fn to_value(&self) -> Value {
        Value::U64(*self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        value.as_u64().ok_or(CodecError::FieldType {
            index: 0,
            expected: "u64",
            got: value.kind(),
        })
    }
}

impl Encodable for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or(CodecError::FieldType {
            index: 0,
            expected: "bool",
            got: value.kind(),
        })
    }
}

impl<const N: usize> Encodable for [u8; N] {
    fn to_value(&self) -> Value {
        Value::Bytes(self.to_vec())
    }

    fn from_value(value: &Value) -> Result<Self> {
        let bytes = value.as_bytes().ok_or(CodecError::FieldType {
            index: 0,
            expected: "bytes",
            got: value.kind(),
        })?;
        let mut out = [0u8; N];
        if bytes.len() != N {
            return Err(CodecError::FieldType {
                index: 0,
                expected: "bytes (fixed width)",
                got: "bytes (wrong width)",
            });
        }
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

/// Encode an optional text field using the empty-string stand-in.
///
/// Field positions are fixed, so absence is encoded explicitly rather
/// than by omission. The empty string is reserved as the stand-in;
/// genuine empty values are not representable, which every message
/// shape using this helper accepts by construction.
pub fn optional_text(field: Option<&str>) -> Value {
    Value::Text(field.unwrap_or_default().to_owned())
}

/// Decode an optional text field, mapping the stand-in back to `None`.
pub fn decode_optional_text(value: &Value) -> Result<Option<String>> {
    let text = value.as_text().ok_or(CodecError::FieldType {
        index: 0,
        expected: "text",
        got: value.kind(),
    })?;
    Ok(if text.is_empty() {
        None
    } else {
        Some(text.to_owned())
    })
}

/// Encode an optional byte-string field using the empty stand-in.
///
/// Same contract as [`optional_text`]: the empty byte string is
/// reserved as the stand-in for absence.
pub fn optional_bytes(field: Option<&[u8]>) -> Value {
    Value::Bytes(field.unwrap_or_default().to_vec())
}

/// Decode an optional byte-string field, mapping the stand-in back to
/// `None`.
pub fn decode_optional_bytes(value: &Value) -> Result<Option<Vec<u8>>> {
    let bytes = value.as_bytes().ok_or(CodecError::FieldType {
        index: 0,
        expected: "bytes",
        got: value.kind(),
    })?;
    Ok(if bytes.is_empty() {
        None
    } else {
        Some(bytes.to_vec())
    })
}

/// Exact-arity reader over a payload field list.
///
/// Construction fails unless the payload is a `List` with exactly the
/// expected number of fields; accessors fail if a position holds the
/// wrong kind. Positions are zero-based.
pub struct FieldReader<'a> {
    fields: &'a [Value],
}

impl<'a> FieldReader<'a> {
    /// Open a reader over `payload`, requiring exactly `expected`
    /// fields.
    ///
    /// # Errors
    ///
    /// [`CodecError::NotAList`] if the payload is not a list;
    /// [`CodecError::FieldCount`] if the arity does not match.
    pub fn new(payload: &'a Value, expected: usize) -> Result<Self> {
        let fields = payload.as_list().ok_or(CodecError::NotAList {
            got: payload.kind(),
        })?;
        if fields.len() != expected {
            return Err(CodecError::FieldCount {
                expected,
                got: fields.len(),
            });
        }
        Ok(Self { fields })
    }

    fn field(&self, index: usize) -> &'a Value {
        // Arity is checked at construction; out-of-range access is a
        // caller bug in the message definition itself.
        &self.fields[index]
    }

    /// Read the byte-string field at `index`.
    pub fn bytes(&self, index: usize) -> Result<Vec<u8>> {
        let value = self.field(index);
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or(CodecError::FieldType {
                index,
                expected: "bytes",
                got: value.kind(),
            })
    }

    /// Read the fixed-width byte field at `index`.
    pub fn bytes_fixed<const N: usize>(&self, index: usize) -> Result<[u8; N]> {
        let value = self.field(index);
        <[u8; N]>::from_value(value).map_err(|_| CodecError::FieldType {
            index,
            expected: "bytes (fixed width)",
            got: value.kind(),
        })
    }

    /// Read the text field at `index`.
    pub fn text(&self, index: usize) -> Result<String> {
        let value = self.field(index);
        value
            .as_text()
            .map(str::to_owned)
            .ok_or(CodecError::FieldType {
                index,
                expected: "text",
                got: value.kind(),
            })
    }

    /// Read the optional text field at `index` (empty-string
    /// stand-in maps to `None`).
    pub fn optional_text(&self, index: usize) -> Result<Option<String>> {
        decode_optional_text(self.field(index)).map_err(|_| CodecError::FieldType {
            index,
            expected: "text",
            got: self.field(index).kind(),
        })
    }

    /// Read the optional byte-string field at `index` (empty stand-in
    /// maps to `None`).
    pub fn optional_bytes(&self, index: usize) -> Result<Option<Vec<u8>>> {
        decode_optional_bytes(self.field(index)).map_err(|_| CodecError::FieldType {
            index,
            expected: "bytes",
            got: self.field(index).kind(),
        })
    }

    /// Read the integer field at `index`.
    pub fn u64(&self, index: usize) -> Result<u64> {
        let value = self.field(index);
        value.as_u64().ok_or(CodecError::FieldType {
            index,
            expected: "u64",
            got: value.kind(),
        })
    }

    /// Read the boolean field at `index`.
    pub fn bool(&self, index: usize) -> Result<bool> {
        let value = self.field(index);
        value.as_bool().ok_or(CodecError::FieldType {
            index,
            expected: "bool",
            got: value.kind(),
        })
    }

    /// Borrow the nested list field at `index`.
    pub fn list(&self, index: usize) -> Result<&'a [Value]> {
        let value = self.field(index);
        value.as_list().ok_or(CodecError::FieldType {
            index,
            expected: "list",
            got: value.kind(),
        })
    }
}
