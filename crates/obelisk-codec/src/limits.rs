//! Size and depth limits enforced by the codec.
//!
//! All limits apply during decoding before any allocation is sized
//! from attacker-controlled lengths.

/// Maximum total size of an encoded value in bytes (1 MiB).
///
/// Protocol messages are small control-plane payloads; anything close
/// to this limit is hostile or corrupted.
pub const MAX_ENCODED_SIZE: usize = 1024 * 1024;

/// Maximum nesting depth of `List` values.
///
/// Bounds decoder recursion against stack-exhaustion payloads.
pub const MAX_NESTING_DEPTH: usize = 16;

/// Size of a value header on the wire: 1 tag byte + 4 length bytes.
pub const HEADER_SIZE: usize = 5;
