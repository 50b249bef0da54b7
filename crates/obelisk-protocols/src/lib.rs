//! # obelisk-protocols
//!
//! Concrete protocol definitions executed by the
//! [`obelisk-engine`](obelisk_engine) crate.
//!
//! Each protocol is a self-contained module: its state machine, its
//! message set with their fixed wire shapes, and its steps. The engine
//! knows nothing about any of them beyond the [`Protocol`] contract.
//!
//! | Protocol | Id | Purpose |
//! |----------|----|---------|
//! | [`IdentityBindingProtocol`] | `0x0001` | Bind or unbind an owned identity to an external identity provider, mirrored across the owner's devices |
//! | [`ContactInvitationProtocol`] | `0x0002` | Upgrade a relationship with a remote contact through an invite/answer exchange |
//!
//! [`Protocol`]: obelisk_engine::Protocol

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod contact_invitation;
pub mod identity_binding;

pub use contact_invitation::ContactInvitationProtocol;
pub use identity_binding::IdentityBindingProtocol;

use obelisk_engine::ProtocolRegistry;

/// Register every protocol this crate defines.
pub fn register_all(registry: &mut ProtocolRegistry) {
    registry
        .register::<IdentityBindingProtocol>()
        .register::<ContactInvitationProtocol>();
}
