//! Upgrading a relationship with a remote contact.
//!
//! The inviter asks a contact to upgrade their relationship; the
//! contact's host application shows a dialog and answers; the answer
//! travels back. Both parties run the same protocol under one shared
//! instance id, and each fans its own side's progress out to its
//! sibling devices so every device converges.
//!
//! ## Message flow
//!
//! ```text
//! inviter                               contact
//! ───────                               ───────
//! Initiate (local)
//!   Invitation ──────────────────────▶  notify: invitation received
//!   PropagateInvitation ─▶ siblings
//!                                       AcceptDialog (local)
//!   notify: answered  ◀──────────────   Response
//!   PropagateResponse ─▶ siblings       PropagateResponse ─▶ siblings
//! ```
//!
//! The invitation can reach a contact with no established channel yet,
//! so the first hop falls back to a one-shot pre-key channel when
//! needed. The inviter can abort a pending invitation; the abort
//! travels to the contact and to the inviter's siblings alike.

use async_trait::async_trait;

use obelisk_codec::{CodecError, FieldReader, Value};
use obelisk_engine::{
    ChannelIntent, ChannelRequirement, IdentityId, MessageEnvelope, MessageTag, Notification,
    OutboundIntent, Protocol, ProtocolConfig, ProtocolId, ProtocolPayload, ProtocolState,
    ProtocolStep, StateId, StepContext, StepError, StepResult, Transition,
};

/// Message tag of the local invite trigger.
pub const INITIATE: MessageTag = MessageTag(0);
/// Message tag of the invitation sent to the contact.
pub const INVITATION: MessageTag = MessageTag(1);
/// Message tag of the local dialog answer.
pub const ACCEPT_DIALOG: MessageTag = MessageTag(2);
/// Message tag of the answer sent back to the inviter.
pub const RESPONSE: MessageTag = MessageTag(3);
/// Message tag of the invitation mirrored to the inviter's siblings.
pub const PROPAGATE_INVITATION: MessageTag = MessageTag(4);
/// Message tag of the answer mirrored to either party's siblings.
pub const PROPAGATE_RESPONSE: MessageTag = MessageTag(5);
/// Message tag of the local abort trigger.
pub const ABORT: MessageTag = MessageTag(6);
/// Message tag of the abort sent to the contact and to siblings.
pub const INVITATION_ABORTED: MessageTag = MessageTag(7);

/// The messages of the invitation protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvitationPayload {
    /// Local trigger: invite `contact`.
    Initiate {
        /// The contact to invite.
        contact: IdentityId,
    },
    /// The invitation as received by the contact. The inviter is the
    /// envelope sender.
    Invitation,
    /// Local trigger: the user answered the invitation dialog.
    AcceptDialog {
        /// The user's answer.
        accepted: bool,
    },
    /// The contact's answer as received by the inviter.
    Response {
        /// The contact's answer.
        accepted: bool,
    },
    /// A sibling device sent the invitation; mirror the pending state.
    PropagateInvitation {
        /// The invited contact.
        contact: IdentityId,
    },
    /// A sibling device saw the answer; mirror the outcome.
    PropagateResponse {
        /// The other party of the exchange.
        contact: IdentityId,
        /// The answer.
        accepted: bool,
    },
    /// Local trigger: withdraw a pending invitation.
    Abort,
    /// The pending invitation was withdrawn, by the inviter (over a
    /// remote channel) or by a sibling device (propagated).
    InvitationAborted,
}

impl ProtocolPayload for InvitationPayload {
    fn tag(&self) -> MessageTag {
        match self {
            InvitationPayload::Initiate { .. } => INITIATE,
            InvitationPayload::Invitation => INVITATION,
            InvitationPayload::AcceptDialog { .. } => ACCEPT_DIALOG,
            InvitationPayload::Response { .. } => RESPONSE,
            InvitationPayload::PropagateInvitation { .. } => PROPAGATE_INVITATION,
            InvitationPayload::PropagateResponse { .. } => PROPAGATE_RESPONSE,
            InvitationPayload::Abort => ABORT,
            InvitationPayload::InvitationAborted => INVITATION_ABORTED,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            InvitationPayload::Initiate { contact }
            | InvitationPayload::PropagateInvitation { contact } => {
                Value::List(vec![Value::Bytes(contact.as_bytes().to_vec())])
            }
            InvitationPayload::AcceptDialog { accepted }
            | InvitationPayload::Response { accepted } => {
                Value::List(vec![Value::Bool(*accepted)])
            }
            InvitationPayload::PropagateResponse { contact, accepted } => Value::List(vec![
                Value::Bytes(contact.as_bytes().to_vec()),
                Value::Bool(*accepted),
            ]),
            InvitationPayload::Invitation
            | InvitationPayload::Abort
            | InvitationPayload::InvitationAborted => Value::List(Vec::new()),
        }
    }

    fn from_value(tag: MessageTag, payload: &Value) -> obelisk_codec::Result<Self> {
        match tag {
            INITIATE => {
                let fields = FieldReader::new(payload, 1)?;
                Ok(InvitationPayload::Initiate {
                    contact: IdentityId::from_bytes(fields.bytes_fixed(0)?),
                })
            }
            INVITATION => {
                FieldReader::new(payload, 0)?;
                Ok(InvitationPayload::Invitation)
            }
            ACCEPT_DIALOG => {
                let fields = FieldReader::new(payload, 1)?;
                Ok(InvitationPayload::AcceptDialog {
                    accepted: fields.bool(0)?,
                })
            }
            RESPONSE => {
                let fields = FieldReader::new(payload, 1)?;
                Ok(InvitationPayload::Response {
                    accepted: fields.bool(0)?,
                })
            }
            PROPAGATE_INVITATION => {
                let fields = FieldReader::new(payload, 1)?;
                Ok(InvitationPayload::PropagateInvitation {
                    contact: IdentityId::from_bytes(fields.bytes_fixed(0)?),
                })
            }
            PROPAGATE_RESPONSE => {
                let fields = FieldReader::new(payload, 2)?;
                Ok(InvitationPayload::PropagateResponse {
                    contact: IdentityId::from_bytes(fields.bytes_fixed(0)?),
                    accepted: fields.bool(1)?,
                })
            }
            ABORT => {
                FieldReader::new(payload, 0)?;
                Ok(InvitationPayload::Abort)
            }
            INVITATION_ABORTED => {
                FieldReader::new(payload, 0)?;
                Ok(InvitationPayload::InvitationAborted)
            }
            other => Err(CodecError::UnknownMessageTag { tag: other.0 }),
        }
    }
}

/// The state machine of the invitation protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvitationState {
    /// Nothing happened yet.
    Initial,
    /// This side invited `contact` and awaits the answer.
    InvitationSent {
        /// The invited contact.
        contact: IdentityId,
    },
    /// This side was invited by `contact` and awaits the local answer.
    InvitationReceived {
        /// The inviting contact.
        contact: IdentityId,
    },
    /// The exchange completed.
    Finished,
    /// The exchange was withdrawn or aborted.
    Cancelled,
}

impl ProtocolState for InvitationState {
    fn initial() -> Self {
        InvitationState::Initial
    }

    fn aborted() -> Self {
        InvitationState::Cancelled
    }

    fn state_id(&self) -> StateId {
        match self {
            InvitationState::Initial => StateId(0),
            InvitationState::InvitationSent { .. } => StateId(1),
            InvitationState::InvitationReceived { .. } => StateId(2),
            InvitationState::Finished => StateId(3),
            InvitationState::Cancelled => StateId(4),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, InvitationState::Finished | InvitationState::Cancelled)
    }

    fn to_value(&self) -> Value {
        match self {
            InvitationState::InvitationSent { contact }
            | InvitationState::InvitationReceived { contact } => {
                Value::List(vec![Value::Bytes(contact.as_bytes().to_vec())])
            }
            _ => Value::List(Vec::new()),
        }
    }

    fn from_value(id: StateId, value: &Value) -> obelisk_codec::Result<Self> {
        match id.0 {
            0 => {
                FieldReader::new(value, 0)?;
                Ok(InvitationState::Initial)
            }
            1 => {
                let fields = FieldReader::new(value, 1)?;
                Ok(InvitationState::InvitationSent {
                    contact: IdentityId::from_bytes(fields.bytes_fixed(0)?),
                })
            }
            2 => {
                let fields = FieldReader::new(value, 1)?;
                Ok(InvitationState::InvitationReceived {
                    contact: IdentityId::from_bytes(fields.bytes_fixed(0)?),
                })
            }
            3 => {
                FieldReader::new(value, 0)?;
                Ok(InvitationState::Finished)
            }
            4 => {
                FieldReader::new(value, 0)?;
                Ok(InvitationState::Cancelled)
            }
            other => Err(CodecError::UnknownMessageTag { tag: other }),
        }
    }
}

fn envelope_to(
    ctx: &StepContext<'_>,
    recipient: IdentityId,
    payload: &InvitationPayload,
) -> MessageEnvelope {
    MessageEnvelope {
        protocol: ctx.protocol,
        instance: ctx.instance,
        tag: payload.tag(),
        sender: ctx.owned_identity,
        recipient,
        payload: payload.to_value(),
    }
}

/// Outbound intent mirroring `payload` to the owner's sibling devices,
/// when there are any.
async fn sibling_propagation(
    ctx: &StepContext<'_>,
    payload: &InvitationPayload,
) -> StepResult<Option<OutboundIntent>> {
    let siblings = ctx
        .identity_store()
        .list_other_device_ids(ctx.owned_identity)
        .await?;
    if siblings.is_empty() {
        return Ok(None);
    }
    Ok(Some(OutboundIntent {
        envelope: envelope_to(ctx, ctx.owned_identity, payload),
        intent: ChannelIntent::AuthenticatedMultiDevice {
            owner: ctx.owned_identity,
            confirmed_only: true,
        },
    }))
}

struct StartInvitationStep;

#[async_trait]
impl ProtocolStep<ContactInvitationProtocol> for StartInvitationStep {
    fn name(&self) -> &'static str {
        "start-invitation"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        _state: &InvitationState,
        payload: &InvitationPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<InvitationState>> {
        let InvitationPayload::Initiate { contact } = payload else {
            return Err(StepError::Invariant("wrong payload for step".to_owned()));
        };
        if *contact == ctx.owned_identity {
            return Err(StepError::Invariant("cannot invite oneself".to_owned()));
        }

        // The contact may have no established channel yet, so the
        // invitation is allowed to travel over a pre-key channel.
        let mut outbound = vec![OutboundIntent {
            envelope: envelope_to(ctx, *contact, &InvitationPayload::Invitation),
            intent: ChannelIntent::RemoteIdentity {
                identity: *contact,
                allow_prekey_fallback: true,
            },
        }];
        if let Some(propagation) = sibling_propagation(
            ctx,
            &InvitationPayload::PropagateInvitation { contact: *contact },
        )
        .await?
        {
            outbound.push(propagation);
        }

        Ok(Transition {
            next_state: InvitationState::InvitationSent { contact: *contact },
            outbound,
        })
    }
}

/// Shared body of the two invitation-reception steps.
async fn receive_invitation(
    ctx: &StepContext<'_>,
) -> StepResult<Transition<InvitationState>> {
    let contact = ctx.sender;
    ctx.notify(Notification::InvitationReceived {
        owner: ctx.owned_identity,
        from: contact,
    })
    .await;
    Ok(Transition {
        next_state: InvitationState::InvitationReceived { contact },
        outbound: Vec::new(),
    })
}

struct ProcessInvitationStep;

#[async_trait]
impl ProtocolStep<ContactInvitationProtocol> for ProcessInvitationStep {
    fn name(&self) -> &'static str {
        "process-invitation"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::FromRemoteIdentity(None)
    }

    async fn execute(
        &self,
        _state: &InvitationState,
        _payload: &InvitationPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<InvitationState>> {
        receive_invitation(ctx).await
    }
}

struct ProcessInvitationViaPreKeyStep;

#[async_trait]
impl ProtocolStep<ContactInvitationProtocol> for ProcessInvitationViaPreKeyStep {
    fn name(&self) -> &'static str {
        "process-invitation-via-prekey"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::FromAsymmetricPreKey
    }

    async fn execute(
        &self,
        _state: &InvitationState,
        _payload: &InvitationPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<InvitationState>> {
        receive_invitation(ctx).await
    }
}

struct RespondToInvitationStep;

#[async_trait]
impl ProtocolStep<ContactInvitationProtocol> for RespondToInvitationStep {
    fn name(&self) -> &'static str {
        "respond-to-invitation"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        state: &InvitationState,
        payload: &InvitationPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<InvitationState>> {
        let (
            InvitationState::InvitationReceived { contact },
            InvitationPayload::AcceptDialog { accepted },
        ) = (state, payload)
        else {
            return Err(StepError::Invariant("wrong payload for step".to_owned()));
        };

        let mut outbound = vec![OutboundIntent {
            envelope: envelope_to(
                ctx,
                *contact,
                &InvitationPayload::Response {
                    accepted: *accepted,
                },
            ),
            intent: ChannelIntent::RemoteIdentity {
                identity: *contact,
                allow_prekey_fallback: true,
            },
        }];
        if let Some(propagation) = sibling_propagation(
            ctx,
            &InvitationPayload::PropagateResponse {
                contact: *contact,
                accepted: *accepted,
            },
        )
        .await?
        {
            outbound.push(propagation);
        }

        Ok(Transition {
            next_state: InvitationState::Finished,
            outbound,
        })
    }
}

struct ProcessResponseStep {
    contact: IdentityId,
}

#[async_trait]
impl ProtocolStep<ContactInvitationProtocol> for ProcessResponseStep {
    fn name(&self) -> &'static str {
        "process-response"
    }

    fn required_channel(&self) -> ChannelRequirement {
        // Only the invited contact may answer.
        ChannelRequirement::FromRemoteIdentity(Some(self.contact))
    }

    async fn execute(
        &self,
        _state: &InvitationState,
        payload: &InvitationPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<InvitationState>> {
        let InvitationPayload::Response { accepted } = payload else {
            return Err(StepError::Invariant("wrong payload for step".to_owned()));
        };

        ctx.notify(Notification::InvitationAnswered {
            owner: ctx.owned_identity,
            contact: self.contact,
            accepted: *accepted,
        })
        .await;

        let mut outbound = Vec::new();
        if let Some(propagation) = sibling_propagation(
            ctx,
            &InvitationPayload::PropagateResponse {
                contact: self.contact,
                accepted: *accepted,
            },
        )
        .await?
        {
            outbound.push(propagation);
        }

        Ok(Transition {
            next_state: InvitationState::Finished,
            outbound,
        })
    }
}

struct ProcessPropagatedInvitationStep;

#[async_trait]
impl ProtocolStep<ContactInvitationProtocol> for ProcessPropagatedInvitationStep {
    fn name(&self) -> &'static str {
        "process-propagated-invitation"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::FromOtherOwnedDevice
    }

    async fn execute(
        &self,
        _state: &InvitationState,
        payload: &InvitationPayload,
        _ctx: &StepContext<'_>,
    ) -> StepResult<Transition<InvitationState>> {
        let InvitationPayload::PropagateInvitation { contact } = payload else {
            return Err(StepError::Invariant("wrong payload for step".to_owned()));
        };
        Ok(Transition {
            next_state: InvitationState::InvitationSent { contact: *contact },
            outbound: Vec::new(),
        })
    }
}

struct ProcessPropagatedResponseStep;

#[async_trait]
impl ProtocolStep<ContactInvitationProtocol> for ProcessPropagatedResponseStep {
    fn name(&self) -> &'static str {
        "process-propagated-response"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::FromOtherOwnedDevice
    }

    async fn execute(
        &self,
        _state: &InvitationState,
        payload: &InvitationPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<InvitationState>> {
        let InvitationPayload::PropagateResponse { contact, accepted } = payload else {
            return Err(StepError::Invariant("wrong payload for step".to_owned()));
        };
        ctx.notify(Notification::InvitationAnswered {
            owner: ctx.owned_identity,
            contact: *contact,
            accepted: *accepted,
        })
        .await;
        Ok(Transition {
            next_state: InvitationState::Finished,
            outbound: Vec::new(),
        })
    }
}

struct AbortInvitationStep;

#[async_trait]
impl ProtocolStep<ContactInvitationProtocol> for AbortInvitationStep {
    fn name(&self) -> &'static str {
        "abort-invitation"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        state: &InvitationState,
        _payload: &InvitationPayload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<InvitationState>> {
        let InvitationState::InvitationSent { contact } = state else {
            return Err(StepError::Invariant("abort outside pending state".to_owned()));
        };

        let mut outbound = vec![OutboundIntent {
            envelope: envelope_to(ctx, *contact, &InvitationPayload::InvitationAborted),
            intent: ChannelIntent::RemoteIdentity {
                identity: *contact,
                allow_prekey_fallback: true,
            },
        }];
        if let Some(propagation) =
            sibling_propagation(ctx, &InvitationPayload::InvitationAborted).await?
        {
            outbound.push(propagation);
        }

        Ok(Transition {
            next_state: InvitationState::Cancelled,
            outbound,
        })
    }
}

struct ProcessAbortFromContactStep {
    contact: IdentityId,
}

#[async_trait]
impl ProtocolStep<ContactInvitationProtocol> for ProcessAbortFromContactStep {
    fn name(&self) -> &'static str {
        "process-abort-from-contact"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::FromRemoteIdentity(Some(self.contact))
    }

    async fn execute(
        &self,
        _state: &InvitationState,
        _payload: &InvitationPayload,
        _ctx: &StepContext<'_>,
    ) -> StepResult<Transition<InvitationState>> {
        Ok(Transition {
            next_state: InvitationState::Cancelled,
            outbound: Vec::new(),
        })
    }
}

struct ProcessPropagatedAbortStep;

#[async_trait]
impl ProtocolStep<ContactInvitationProtocol> for ProcessPropagatedAbortStep {
    fn name(&self) -> &'static str {
        "process-propagated-abort"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::FromOtherOwnedDevice
    }

    async fn execute(
        &self,
        _state: &InvitationState,
        _payload: &InvitationPayload,
        _ctx: &StepContext<'_>,
    ) -> StepResult<Transition<InvitationState>> {
        Ok(Transition {
            next_state: InvitationState::Cancelled,
            outbound: Vec::new(),
        })
    }
}

/// Upgrades a relationship with a remote contact through an
/// invite/answer exchange mirrored across each party's devices.
pub struct ContactInvitationProtocol;

impl Protocol for ContactInvitationProtocol {
    const ID: ProtocolId = ProtocolId(0x0002);
    const NAME: &'static str = "contact-invitation";

    type State = InvitationState;
    type Payload = InvitationPayload;

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            erase_on_final: true,
        }
    }

    fn candidate_steps(
        state: &Self::State,
        payload: &Self::Payload,
    ) -> Vec<Box<dyn ProtocolStep<Self>>> {
        match (state, payload) {
            (InvitationState::Initial, InvitationPayload::Initiate { .. }) => {
                vec![Box::new(StartInvitationStep)]
            }
            // The invitation can arrive over an established channel or
            // over a one-shot pre-key channel; the arrival channel
            // picks the step.
            (InvitationState::Initial, InvitationPayload::Invitation) => vec![
                Box::new(ProcessInvitationStep),
                Box::new(ProcessInvitationViaPreKeyStep),
            ],
            (InvitationState::Initial, InvitationPayload::PropagateInvitation { .. }) => {
                vec![Box::new(ProcessPropagatedInvitationStep)]
            }
            (InvitationState::Initial, InvitationPayload::PropagateResponse { .. }) => {
                vec![Box::new(ProcessPropagatedResponseStep)]
            }
            (
                InvitationState::InvitationReceived { .. },
                InvitationPayload::AcceptDialog { .. },
            ) => vec![Box::new(RespondToInvitationStep)],
            (
                InvitationState::InvitationSent { contact },
                InvitationPayload::Response { .. },
            ) => vec![Box::new(ProcessResponseStep { contact: *contact })],
            (
                InvitationState::InvitationSent { .. },
                InvitationPayload::PropagateResponse { .. },
            ) => vec![Box::new(ProcessPropagatedResponseStep)],
            (InvitationState::InvitationSent { .. }, InvitationPayload::Abort) => {
                vec![Box::new(AbortInvitationStep)]
            }
            (
                InvitationState::InvitationReceived { contact },
                InvitationPayload::InvitationAborted,
            ) => vec![Box::new(ProcessAbortFromContactStep { contact: *contact })],
            (
                InvitationState::InvitationSent { .. },
                InvitationPayload::InvitationAborted,
            ) => vec![Box::new(ProcessPropagatedAbortStep)],
            _ => Vec::new(),
        }
    }
}
