//! Channel intents, reception channels, and the channel selector.
//!
//! A step never names a socket or a session; it names a *logical*
//! delivery intent for outbound messages and a *requirement* for the
//! channel an inbound message must have arrived on. The selector
//! resolves intents to concrete channels at delivery time and
//! validates requirements against what the transport actually
//! authenticated — fail-closed, because a remote party must never be
//! able to forge a "local trigger" message.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::message::InboundMessage;
use crate::ports::{ChannelTransport, IdentityStore, PortResult};
use crate::types::{DeviceId, IdentityId};

/// The logical delivery intent of an outbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelIntent {
    /// Same device, no network hop. Used for locally triggered
    /// protocol actions.
    Local,
    /// Encrypted channels to the owner's *other* devices. Resolution
    /// enumerates all currently registered sibling devices; an empty
    /// set makes the send a silent no-op.
    AuthenticatedMultiDevice {
        /// The identity whose sibling devices are addressed.
        owner: IdentityId,
        /// When set, devices without a confirmed channel are skipped
        /// instead of falling back to one-shot pre-key channels.
        confirmed_only: bool,
    },
    /// Channels to all devices of a remote identity. Requires an
    /// established channel, or falls back to a one-shot asymmetric
    /// pre-key channel when policy allows.
    RemoteIdentity {
        /// The remote party.
        identity: IdentityId,
        /// Whether pre-key fallback is allowed for unreachable
        /// devices.
        allow_prekey_fallback: bool,
    },
}

/// What the transport authenticated about an inbound message's
/// arrival.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceptionChannel {
    /// Injected on this device; never crossed the network.
    Local,
    /// Arrived over an established secure channel whose remote end is
    /// authenticated.
    SecureChannel {
        /// The authenticated remote identity.
        remote_identity: IdentityId,
        /// The authenticated remote device.
        remote_device: DeviceId,
    },
    /// Arrived over a one-shot asymmetric pre-key channel. The sender
    /// is *claimed*, not authenticated.
    AsymmetricPreKey,
}

/// The channel kind a step requires its triggering message to have
/// arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRequirement {
    /// Must be a local injection. Rejects anything that crossed the
    /// network.
    Local,
    /// Must come from another device of the *same* owning identity
    /// over an authenticated channel.
    FromOtherOwnedDevice,
    /// Must come from a remote identity over an authenticated
    /// channel; `Some` pins the expected identity.
    FromRemoteIdentity(Option<IdentityId>),
    /// Must have arrived over an asymmetric pre-key channel. Origin
    /// cannot be authenticated; only protocols that establish trust
    /// by other means may use this.
    FromAsymmetricPreKey,
}

/// A concrete transport channel an intent resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedChannel {
    /// In-process loopback to this device's own engine.
    Loopback,
    /// A confirmed secure channel to one remote device.
    Secure {
        /// The remote identity.
        remote_identity: IdentityId,
        /// The remote device.
        remote_device: DeviceId,
    },
    /// A one-shot asymmetric pre-key channel to one remote device.
    PreKey {
        /// The remote identity.
        remote_identity: IdentityId,
        /// The remote device.
        remote_device: DeviceId,
    },
}

/// Why an inbound message failed channel validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelViolation {
    /// A network-received message claimed a local-only trigger, or a
    /// local message was offered to a network-only step.
    KindMismatch,
    /// The claimed origin identity does not match the channel's
    /// authenticated sender.
    SenderMismatch,
    /// A multi-device message came from a device that is not
    /// registered under the receiving identity.
    NotASiblingDevice,
}

/// Resolves logical intents to concrete channels and validates
/// inbound arrival channels against step requirements.
///
/// Stateless: all knowledge about devices and channels lives in the
/// identity store and the transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelSelector;

impl ChannelSelector {
    /// Resolve a delivery intent to zero or more concrete channels.
    ///
    /// An empty result is a valid outcome: multi-device propagation
    /// with no sibling devices is a silent no-op, and remote devices
    /// without a confirmed channel are skipped when pre-key fallback
    /// is not allowed (with a diagnostic).
    pub async fn resolve_for_send(
        &self,
        intent: ChannelIntent,
        owned: IdentityId,
        identity_store: &dyn IdentityStore,
        transport: &dyn ChannelTransport,
    ) -> PortResult<Vec<ResolvedChannel>> {
        match intent {
            ChannelIntent::Local => Ok(vec![ResolvedChannel::Loopback]),
            ChannelIntent::AuthenticatedMultiDevice {
                owner,
                confirmed_only,
            } => {
                let devices = identity_store.list_other_device_ids(owner).await?;
                if devices.is_empty() {
                    debug!(owner = %owner, "no sibling devices, nothing to propagate to");
                    return Ok(Vec::new());
                }
                self.channels_to_devices(owned, owner, devices, !confirmed_only, transport)
                    .await
            }
            ChannelIntent::RemoteIdentity {
                identity,
                allow_prekey_fallback,
            } => {
                let devices = identity_store.list_device_ids(identity).await?;
                if devices.is_empty() {
                    warn!(remote = %identity, "remote identity has no known devices");
                    return Ok(Vec::new());
                }
                self.channels_to_devices(owned, identity, devices, allow_prekey_fallback, transport)
                    .await
            }
        }
    }

    async fn channels_to_devices(
        &self,
        owned: IdentityId,
        remote_identity: IdentityId,
        devices: std::collections::BTreeSet<DeviceId>,
        allow_prekey: bool,
        transport: &dyn ChannelTransport,
    ) -> PortResult<Vec<ResolvedChannel>> {
        let mut channels = Vec::with_capacity(devices.len());
        for remote_device in devices {
            if transport
                .has_confirmed_channel(owned, remote_identity, remote_device)
                .await?
            {
                channels.push(ResolvedChannel::Secure {
                    remote_identity,
                    remote_device,
                });
            } else if allow_prekey {
                channels.push(ResolvedChannel::PreKey {
                    remote_identity,
                    remote_device,
                });
            } else {
                warn!(
                    remote = %remote_identity,
                    device = %remote_device,
                    "no confirmed channel and pre-key fallback not allowed, skipping device"
                );
            }
        }
        Ok(channels)
    }

    /// Validate that an inbound message arrived on a channel
    /// consistent with a step's requirement.
    ///
    /// Checks, in order: the channel kind matches the requirement;
    /// the claimed origin matches the channel's authenticated sender;
    /// and, for multi-device propagation, the sender is a device of
    /// the *same* owning identity as the receiver.
    ///
    /// # Errors
    ///
    /// Returns the specific [`ChannelViolation`]. The caller drops
    /// the message without mutating any state.
    pub async fn validate_on_receive(
        &self,
        requirement: ChannelRequirement,
        inbound: &InboundMessage,
        owned: IdentityId,
        identity_store: &dyn IdentityStore,
    ) -> PortResult<Result<(), ChannelViolation>> {
        let sender = inbound.envelope.sender;
        let verdict = match (requirement, inbound.channel) {
            (ChannelRequirement::Local, ReceptionChannel::Local) => {
                // Local messages are self-addressed; anything else is
                // a forged trigger.
                if sender == owned {
                    Ok(())
                } else {
                    Err(ChannelViolation::SenderMismatch)
                }
            }
            (
                ChannelRequirement::FromOtherOwnedDevice,
                ReceptionChannel::SecureChannel {
                    remote_identity,
                    remote_device,
                },
            ) => {
                if remote_identity != owned || sender != owned {
                    Err(ChannelViolation::SenderMismatch)
                } else {
                    let siblings = identity_store.list_other_device_ids(owned).await?;
                    if siblings.contains(&remote_device) {
                        Ok(())
                    } else {
                        Err(ChannelViolation::NotASiblingDevice)
                    }
                }
            }
            (
                ChannelRequirement::FromRemoteIdentity(expected),
                ReceptionChannel::SecureChannel {
                    remote_identity, ..
                },
            ) => {
                if remote_identity == owned || sender != remote_identity {
                    Err(ChannelViolation::SenderMismatch)
                } else if expected.is_some_and(|id| id != remote_identity) {
                    Err(ChannelViolation::SenderMismatch)
                } else {
                    Ok(())
                }
            }
            (ChannelRequirement::FromAsymmetricPreKey, ReceptionChannel::AsymmetricPreKey) => {
                // Nothing about the sender is authenticated here; the
                // protocol itself must establish trust.
                Ok(())
            }
            _ => Err(ChannelViolation::KindMismatch),
        };
        Ok(verdict)
    }
}
