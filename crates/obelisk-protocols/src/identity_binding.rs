//! Binding an owned identity to an external identity provider.
//!
//! Binding and unbinding are single-shot protocols: a locally
//! triggered instance applies the change on this device, then fans the
//! same fact out to the owner's other devices so every device converges
//! on the same provider state. A propagated message carries the full
//! provider state because the receiving device cannot re-fetch any of
//! it on its own.
//!
//! ## Message flow
//!
//! ```text
//! device A                              device B (sibling)
//! ───────                               ──────────────────
//! InitiateBinding (local)
//!   apply binding locally
//!   PropagateBinding ────────────────▶  apply binding
//!                                       notify: resync with provider
//! ```
//!
//! Finished instances are kept rather than erased, so a propagated
//! message delivered twice finds the finished instance and is dropped
//! instead of spawning a fresh one.

use async_trait::async_trait;
use tracing::debug;

use obelisk_codec::{optional_bytes, optional_text, CodecError, FieldReader, Value};
use obelisk_engine::{
    ChannelIntent, ChannelRequirement, MessageEnvelope, MessageTag, Notification, OutboundIntent,
    Protocol, ProtocolConfig, ProtocolId, ProtocolPayload, ProtocolState, ProtocolStep,
    ProviderBinding, StateId, StepContext, StepError, StepResult, Transition,
};

/// Message tag of the local binding trigger.
pub const INITIATE_BINDING: MessageTag = MessageTag(0);
/// Message tag of the binding propagated to sibling devices.
pub const PROPAGATE_BINDING: MessageTag = MessageTag(1);
/// Message tag of the local unbinding trigger.
pub const INITIATE_UNBINDING: MessageTag = MessageTag(2);
/// Message tag of the unbinding propagated to sibling devices.
pub const PROPAGATE_UNBINDING: MessageTag = MessageTag(3);

/// The provider state a binding message carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingDetails {
    /// The owner's user id at the identity provider.
    pub external_user_id: String,
    /// The full provider state to apply.
    pub binding: ProviderBinding,
}

impl BindingDetails {
    fn to_value(&self) -> Value {
        Value::List(vec![
            Value::Text(self.external_user_id.clone()),
            Value::Text(self.binding.server_url.clone()),
            Value::Text(self.binding.client_id.clone()),
            optional_text(self.binding.client_secret.as_deref()),
            Value::Bytes(self.binding.key_set.clone()),
            optional_bytes(self.binding.signature_verification_key.as_deref()),
        ])
    }

    fn from_value(payload: &Value) -> obelisk_codec::Result<Self> {
        let fields = FieldReader::new(payload, 6)?;
        Ok(Self {
            external_user_id: fields.text(0)?,
            binding: ProviderBinding {
                server_url: fields.text(1)?,
                client_id: fields.text(2)?,
                client_secret: fields.optional_text(3)?,
                key_set: fields.bytes(4)?,
                signature_verification_key: fields.optional_bytes(5)?,
            },
        })
    }
}

/// The messages of the binding protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindingPayload {
    /// Local trigger: bind this identity to the provider.
    InitiateBinding(BindingDetails),
    /// A sibling device bound the identity; apply the same fact.
    PropagateBinding(BindingDetails),
    /// Local trigger: remove any provider binding.
    InitiateUnbinding,
    /// A sibling device removed the binding; apply the same fact.
    PropagateUnbinding,
}

impl ProtocolPayload for BindingPayload {
    fn tag(&self) -> MessageTag {
        match self {
            BindingPayload::InitiateBinding(_) => INITIATE_BINDING,
            BindingPayload::PropagateBinding(_) => PROPAGATE_BINDING,
            BindingPayload::InitiateUnbinding => INITIATE_UNBINDING,
            BindingPayload::PropagateUnbinding => PROPAGATE_UNBINDING,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            BindingPayload::InitiateBinding(details)
            | BindingPayload::PropagateBinding(details) => details.to_value(),
            BindingPayload::InitiateUnbinding | BindingPayload::PropagateUnbinding => {
                Value::List(Vec::new())
            }
        }
    }

    fn from_value(tag: MessageTag, payload: &Value) -> obelisk_codec::Result<Self> {
        match tag {
            INITIATE_BINDING => Ok(BindingPayload::InitiateBinding(BindingDetails::from_value(
                payload,
            )?)),
            PROPAGATE_BINDING => Ok(BindingPayload::PropagateBinding(
                BindingDetails::from_value(payload)?,
            )),
            INITIATE_UNBINDING => {
                FieldReader::new(payload, 0)?;
                Ok(BindingPayload::InitiateUnbinding)
            }
            PROPAGATE_UNBINDING => {
                FieldReader::new(payload, 0)?;
                Ok(BindingPayload::PropagateUnbinding)
            }
            other => Err(CodecError::UnknownMessageTag { tag: other.0 }),
        }
    }
}

/// The two-state machine of the binding protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingState {
    /// Nothing applied yet.
    Initial,
    /// The change was applied (or the instance was aborted).
    Finished,
}

impl ProtocolState for BindingState {
    fn initial() -> Self {
        BindingState::Initial
    }

    fn aborted() -> Self {
        BindingState::Finished
    }

    fn state_id(&self) -> StateId {
        match self {
            BindingState::Initial => StateId(0),
            BindingState::Finished => StateId(1),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, BindingState::Finished)
    }

    fn to_value(&self) -> Value {
        Value::List(Vec::new())
    }

    fn from_value(id: StateId, value: &Value) -> obelisk_codec::Result<Self> {
        FieldReader::new(value, 0)?;
        match id.0 {
            0 => Ok(BindingState::Initial),
            1 => Ok(BindingState::Finished),
            other => Err(CodecError::UnknownMessageTag { tag: other }),
        }
    }
}

fn propagation_envelope(ctx: &StepContext<'_>, payload: &BindingPayload) -> MessageEnvelope {
    MessageEnvelope {
        protocol: ctx.protocol,
        instance: ctx.instance,
        tag: payload.tag(),
        sender: ctx.owned_identity,
        recipient: ctx.owned_identity,
        payload: payload.to_value(),
    }
}

/// Shared body of the two binding steps. `local` distinguishes the
/// device where the user triggered the change from a device applying a
/// propagated copy.
async fn apply_binding(
    ctx: &StepContext<'_>,
    details: &BindingDetails,
    local: bool,
) -> StepResult<Transition<BindingState>> {
    if local && details.binding.signature_verification_key.is_none() {
        // The propagated copy must let siblings verify provider
        // signatures; binding without the key would poison them all.
        return Err(StepError::Invariant(
            "binding has no signature verification key".to_owned(),
        ));
    }

    ctx.identity_store()
        .bind_identity(
            ctx.owned_identity,
            &details.external_user_id,
            details.binding.clone(),
        )
        .await?;
    debug!(owner = %ctx.owned_identity, local, "identity provider binding applied");

    let mut outbound = Vec::new();
    if local {
        let siblings = ctx
            .identity_store()
            .list_other_device_ids(ctx.owned_identity)
            .await?;
        if !siblings.is_empty() {
            let propagated = BindingPayload::PropagateBinding(details.clone());
            outbound.push(OutboundIntent {
                envelope: propagation_envelope(ctx, &propagated),
                intent: ChannelIntent::AuthenticatedMultiDevice {
                    owner: ctx.owned_identity,
                    confirmed_only: true,
                },
            });
        }
    } else {
        // Locally-omitted provider material (tokens, fresh keys) must
        // be re-fetched by the host on this device.
        ctx.notify(Notification::ResyncWithIdentityProvider {
            owner: ctx.owned_identity,
        })
        .await;
    }

    Ok(Transition {
        next_state: BindingState::Finished,
        outbound,
    })
}

/// Shared body of the two unbinding steps.
async fn apply_unbinding(
    ctx: &StepContext<'_>,
    local: bool,
) -> StepResult<Transition<BindingState>> {
    ctx.identity_store()
        .unbind_identity(ctx.owned_identity)
        .await?;
    debug!(owner = %ctx.owned_identity, local, "identity provider binding removed");

    let mut outbound = Vec::new();
    if local {
        let siblings = ctx
            .identity_store()
            .list_other_device_ids(ctx.owned_identity)
            .await?;
        if !siblings.is_empty() {
            outbound.push(OutboundIntent {
                envelope: propagation_envelope(ctx, &BindingPayload::PropagateUnbinding),
                intent: ChannelIntent::AuthenticatedMultiDevice {
                    owner: ctx.owned_identity,
                    confirmed_only: true,
                },
            });
        }
    }

    Ok(Transition {
        next_state: BindingState::Finished,
        outbound,
    })
}

struct BindLocallyStep;

#[async_trait]
impl ProtocolStep<IdentityBindingProtocol> for BindLocallyStep {
    fn name(&self) -> &'static str {
        "bind-locally"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        _state: &BindingState,
        payload: &BindingPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<BindingState>> {
        let BindingPayload::InitiateBinding(details) = payload else {
            return Err(StepError::Invariant("wrong payload for step".to_owned()));
        };
        apply_binding(ctx, details, true).await
    }
}

struct ProcessPropagatedBindingStep;

#[async_trait]
impl ProtocolStep<IdentityBindingProtocol> for ProcessPropagatedBindingStep {
    fn name(&self) -> &'static str {
        "process-propagated-binding"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::FromOtherOwnedDevice
    }

    async fn execute(
        &self,
        _state: &BindingState,
        payload: &BindingPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<BindingState>> {
        let BindingPayload::PropagateBinding(details) = payload else {
            return Err(StepError::Invariant("wrong payload for step".to_owned()));
        };
        apply_binding(ctx, details, false).await
    }
}

struct UnbindLocallyStep;

#[async_trait]
impl ProtocolStep<IdentityBindingProtocol> for UnbindLocallyStep {
    fn name(&self) -> &'static str {
        "unbind-locally"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        _state: &BindingState,
        _payload: &BindingPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<BindingState>> {
        apply_unbinding(ctx, true).await
    }
}

struct ProcessPropagatedUnbindingStep;

#[async_trait]
impl ProtocolStep<IdentityBindingProtocol> for ProcessPropagatedUnbindingStep {
    fn name(&self) -> &'static str {
        "process-propagated-unbinding"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::FromOtherOwnedDevice
    }

    async fn execute(
        &self,
        _state: &BindingState,
        _payload: &BindingPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<BindingState>> {
        apply_unbinding(ctx, false).await
    }
}

/// Binds or unbinds an owned identity to an external identity
/// provider, mirrored across the owner's devices.
pub struct IdentityBindingProtocol;

impl Protocol for IdentityBindingProtocol {
    const ID: ProtocolId = ProtocolId(0x0001);
    const NAME: &'static str = "identity-binding";

    type State = BindingState;
    type Payload = BindingPayload;

    fn config() -> ProtocolConfig {
        // Keep finished instances: a redelivered propagation must find
        // the finished instance and be dropped, not replayed into a
        // fresh one.
        ProtocolConfig {
            erase_on_final: false,
        }
    }

    fn candidate_steps(
        state: &Self::State,
        payload: &Self::Payload,
    ) -> Vec<Box<dyn ProtocolStep<Self>>> {
        match (state, payload) {
            (BindingState::Initial, BindingPayload::InitiateBinding(_)) => {
                vec![Box::new(BindLocallyStep)]
            }
            (BindingState::Initial, BindingPayload::PropagateBinding(_)) => {
                vec![Box::new(ProcessPropagatedBindingStep)]
            }
            (BindingState::Initial, BindingPayload::InitiateUnbinding) => {
                vec![Box::new(UnbindLocallyStep)]
            }
            (BindingState::Initial, BindingPayload::PropagateUnbinding) => {
                vec![Box::new(ProcessPropagatedUnbindingStep)]
            }
            (BindingState::Finished, _) => Vec::new(),
        }
    }
}
