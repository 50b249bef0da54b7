//! Identifier newtypes used throughout the engine.
//!
//! All random identifiers are generated with OS randomness and are
//! displayed as truncated hex, so they can be logged without flooding
//! output.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Identifies a protocol *type* (identity binding, contact
/// invitation, ...). Part of the wire contract: ids are never reused
/// across incompatible protocol revisions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ProtocolId(pub u16);

/// Tags one message type within a protocol.
///
/// The ordered field list of a message is fixed per tag; changing the
/// list requires a new tag, never an in-place reinterpretation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct MessageTag(pub u16);

/// Tags one state shape within a protocol's state machine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct StateId(pub u16);

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Generate a fresh random identifier using OS randomness.
            pub fn generate() -> Self {
                let mut bytes = [0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Wrap an existing 32-byte identifier.
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Borrow the raw bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Format as a full hex string.
            pub fn to_hex(&self) -> String {
                let mut s = String::with_capacity(64);
                for byte in &self.0 {
                    s.push_str(&format!("{:02x}", byte));
                }
                s
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({}...)"), &self.to_hex()[..8])
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", &self.to_hex()[..8])
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

opaque_id! {
    /// Identifies one running execution of a protocol.
    ///
    /// Chosen by the initiating party; both ends of a protocol run use
    /// the same instance id, which is how inbound messages find their
    /// instance.
    InstanceId
}

opaque_id! {
    /// A cryptographic identity (owned or remote).
    IdentityId
}

opaque_id! {
    /// One device registered under an identity.
    DeviceId
}

/// The identification triple of a protocol instance.
///
/// Instances are scoped to the owning identity: two identities on the
/// same host never share an instance, even for equal instance ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct InstanceKey {
    /// The protocol type.
    pub protocol: ProtocolId,
    /// The instance identifier.
    pub instance: InstanceId,
    /// The identity this instance belongs to.
    pub owner: IdentityId,
}
