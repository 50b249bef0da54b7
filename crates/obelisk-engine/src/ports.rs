//! Narrow capability traits for the engine's external collaborators.
//!
//! The engine never calls raw network or storage APIs directly; steps
//! receive these capabilities through their execution context. All
//! methods are async to support I/O-bound implementations.
//!
//! Failures propagate as [`PortError`] and are treated as recoverable
//! step errors, except for the notification sink, whose delivery is
//! best-effort and must never fail the owning transaction.

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::channel::ResolvedChannel;
use crate::message::MessageEnvelope;
use crate::types::{DeviceId, IdentityId};

/// Convenience result type for collaborator calls.
pub type PortResult<T> = std::result::Result<T, PortError>;

/// Errors returned by external collaborators.
#[derive(Error, Debug, Clone)]
pub enum PortError {
    /// The collaborator is temporarily unavailable (transient).
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other collaborator failure.
    #[error("{0}")]
    Other(String),
}

/// The full identity-provider state an external binding carries.
///
/// A propagated binding must carry everything a sibling device needs
/// to apply the same fact without re-deriving it; the remote device
/// cannot independently re-fetch any of this.
///
/// The client secret is zeroized on drop and redacted from debug
/// output.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ProviderBinding {
    /// Identity-provider server URL.
    pub server_url: String,
    /// OAuth client id registered with the provider.
    pub client_id: String,
    /// OAuth client secret, when the provider requires one.
    pub client_secret: Option<String>,
    /// The provider's serialized key set.
    pub key_set: Vec<u8>,
    /// Key used to verify signatures issued by the provider. Required
    /// for propagation; its absence during a bind is an invariant
    /// violation.
    pub signature_verification_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for ProviderBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBinding")
            .field("server_url", &self.server_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("key_set_len", &self.key_set.len())
            .field(
                "signature_verification_key",
                &self.signature_verification_key.is_some(),
            )
            .finish()
    }
}

/// Access to the identity store: owned identities, their devices, and
/// external identity-provider bindings.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Record that `owner` is bound to the external identity-provider
    /// account `external_user_id`, with the full provider state.
    ///
    /// Re-applying an identical binding must be a no-op, since
    /// propagated bindings can be delivered more than once.
    async fn bind_identity(
        &self,
        owner: IdentityId,
        external_user_id: &str,
        binding: ProviderBinding,
    ) -> PortResult<()>;

    /// Remove any identity-provider binding for `owner`.
    async fn unbind_identity(&self, owner: IdentityId) -> PortResult<()>;

    /// All devices registered for `owner` *other than* the current
    /// one. Empty means there is nothing to propagate to.
    async fn list_other_device_ids(&self, owner: IdentityId) -> PortResult<BTreeSet<DeviceId>>;

    /// All known devices of a remote identity.
    async fn list_device_ids(&self, identity: IdentityId) -> PortResult<BTreeSet<DeviceId>>;
}

/// Handle returned by the transport for one accepted send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryHandle(pub u64);

/// Outbound message delivery over concrete secure channels.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Hand one encoded message to the transport for delivery over
    /// the given resolved channel.
    async fn send(
        &self,
        envelope: MessageEnvelope,
        channel: ResolvedChannel,
    ) -> PortResult<DeliveryHandle>;

    /// Whether a confirmed secure channel exists between the current
    /// device of `owner` and the given remote device.
    async fn has_confirmed_channel(
        &self,
        owner: IdentityId,
        remote_identity: IdentityId,
        remote_device: DeviceId,
    ) -> PortResult<bool>;
}

/// Events steps may post towards the hosting application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// A propagated binding was applied; the owner should
    /// re-synchronize with the identity provider to fetch the
    /// locally-omitted material.
    ResyncWithIdentityProvider {
        /// The identity that should resynchronize.
        owner: IdentityId,
    },
    /// A remote party invited the owner to upgrade their relationship.
    InvitationReceived {
        /// The invited identity.
        owner: IdentityId,
        /// The inviting identity.
        from: IdentityId,
    },
    /// A previously sent invitation was answered.
    InvitationAnswered {
        /// The inviting identity.
        owner: IdentityId,
        /// The invited identity.
        contact: IdentityId,
        /// Whether the invitation was accepted.
        accepted: bool,
    },
}

/// Fire-and-forget notification delivery.
///
/// The contract is at-most-once and non-blocking: implementations
/// must not block the calling transaction, and errors are logged by
/// the engine, never propagated.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Post one notification, best-effort.
    async fn post(&self, notification: Notification) -> PortResult<()>;
}
