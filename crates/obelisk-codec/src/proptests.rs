//! Property-based tests for the codec.
//!
//! These verify the two invariants the engine depends on:
//!
//! - `decode(encode(v)) == v` for every representable value
//! - decoding arbitrary or corrupted bytes never panics; it either
//!   yields a value or a specific `CodecError`

use proptest::prelude::*;

use crate::error::CodecError;
use crate::value::{decode, encode, Value};

/// Strategy producing arbitrary values up to a bounded depth.
fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        prop::collection::vec(any::<u8>(), 0..256).prop_map(Value::Bytes),
        ".{0,64}".prop_map(Value::Text),
        any::<u64>().prop_map(Value::U64),
        any::<bool>().prop_map(Value::Bool),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop::collection::vec(inner, 0..8).prop_map(Value::List)
    })
}

proptest! {
    /// Every representable value survives an encode/decode cycle.
    #[test]
    fn round_trip(value in arb_value()) {
        let bytes = encode(&value);
        prop_assert_eq!(decode(&bytes).unwrap(), value);
    }

    /// Decoding arbitrary bytes never panics.
    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode(&bytes);
    }

    /// Truncating a valid encoding always fails cleanly, never
    /// yielding a value (truncation can only remove bytes a header
    /// already announced).
    #[test]
    fn truncation_is_detected(value in arb_value(), cut in 1usize..16) {
        let bytes = encode(&value);
        prop_assume!(cut < bytes.len());
        let truncated = &bytes[..bytes.len() - cut];
        prop_assert!(decode(truncated).is_err());
    }

    /// Appending garbage after a valid encoding is always rejected as
    /// trailing bytes (or a later structural error), never accepted.
    #[test]
    fn trailing_garbage_is_detected(value in arb_value(), extra in prop::collection::vec(any::<u8>(), 1..16)) {
        let mut bytes = encode(&value);
        bytes.extend_from_slice(&extra);
        prop_assert!(decode(&bytes).is_err());
    }

    /// A field list decoded against the wrong arity fails with
    /// `FieldCount`, not a panic.
    #[test]
    fn wrong_arity_is_field_count(fields in prop::collection::vec(arb_value(), 0..6), expected in 0usize..8) {
        let payload = Value::List(fields.clone());
        let result = crate::encodable::FieldReader::new(&payload, expected);
        if expected == fields.len() {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(
                result.err(),
                Some(CodecError::FieldCount { expected, got: fields.len() })
            );
        }
    }
}
