//! Protocol definitions, steps, and the step registry.
//!
//! A concrete protocol is a declarative bundle: a state machine
//! ([`ProtocolState`]), a message set ([`ProtocolPayload`]), and an
//! exhaustive match from (state variant, message variant) pairs to
//! candidate steps ([`Protocol::candidate_steps`]). The compiler
//! checks the match for missing cases; the engine never inspects
//! protocol internals.
//!
//! ## Step selection
//!
//! Several candidates may exist for one (state, message) pair when
//! the message can legitimately originate from different trigger
//! paths — a locally requested action versus the same action
//! propagated from a sibling device, or a remote message arriving
//! over a confirmed channel versus a pre-key channel. Exactly one is
//! selected per inbound message, based on which channel the message
//! actually arrived on. Two variants sharing transition logic are two
//! thin steps delegating to one shared body, each asserting a
//! different [`ChannelRequirement`].

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use obelisk_codec::{decode, encode, CodecError, Value};

use crate::channel::{ChannelRequirement, ChannelSelector, ChannelViolation};
use crate::error::{StepError, StepResult};
use crate::message::{InboundMessage, OutboundIntent};
use crate::ports::{IdentityStore, Notification, NotificationSink};
use crate::types::{IdentityId, InstanceId, MessageTag, ProtocolId, StateId};

/// Per-protocol configuration, fixed at registration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Whether buffered messages are erased when the instance reaches
    /// a terminal state. Protocols that tolerate late duplicates as
    /// no-op re-applications disable this.
    pub erase_on_final: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            erase_on_final: true,
        }
    }
}

/// The state machine side of a protocol definition.
pub trait ProtocolState: Send + Sync + Sized {
    /// The designated initial variant.
    fn initial() -> Self;

    /// The terminal variant an invariant violation drives the
    /// instance to.
    fn aborted() -> Self;

    /// Tag of this state's shape.
    fn state_id(&self) -> StateId;

    /// Whether no further transitions can occur from this state.
    fn is_terminal(&self) -> bool;

    /// Encode this state's data for persistence.
    fn to_value(&self) -> Value;

    /// Reconstruct a state from its tag and encoded data, strictly.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for unknown state ids or data that
    /// does not match the state shape.
    fn from_value(id: StateId, value: &Value) -> obelisk_codec::Result<Self>;
}

/// The message set side of a protocol definition.
pub trait ProtocolPayload: Send + Sync + Sized {
    /// The message-type tag of this payload.
    fn tag(&self) -> MessageTag;

    /// Encode the payload's fields in their fixed wire order.
    fn to_value(&self) -> Value;

    /// Decode a payload from its tag and field list, strictly.
    ///
    /// # Errors
    ///
    /// [`CodecError::UnknownMessageTag`] for a tag this protocol does
    /// not define; any other [`CodecError`] for fields that do not
    /// match the tag's fixed shape.
    fn from_value(tag: MessageTag, payload: &Value) -> obelisk_codec::Result<Self>;
}

/// The product of a successful step execution.
pub struct Transition<S> {
    /// The state the instance moves to.
    pub next_state: S,
    /// Follow-up messages to deliver after the commit.
    pub outbound: Vec<OutboundIntent>,
}

/// Capabilities available to a step while it executes.
///
/// Steps receive collaborators through this context, never through
/// global state, which keeps them unit-testable in isolation.
pub struct StepContext<'a> {
    /// The identity whose engine is executing the protocol.
    pub owned_identity: IdentityId,
    /// The triggering message's origin identity, as authenticated by
    /// channel validation.
    pub sender: IdentityId,
    /// The protocol type being executed.
    pub protocol: ProtocolId,
    /// The instance being executed.
    pub instance: InstanceId,
    identity_store: &'a dyn IdentityStore,
    notifications: &'a dyn NotificationSink,
}

impl<'a> StepContext<'a> {
    /// Assemble a context. Used by the engine and by step unit tests.
    pub fn new(
        owned_identity: IdentityId,
        sender: IdentityId,
        protocol: ProtocolId,
        instance: InstanceId,
        identity_store: &'a dyn IdentityStore,
        notifications: &'a dyn NotificationSink,
    ) -> Self {
        Self {
            owned_identity,
            sender,
            protocol,
            instance,
            identity_store,
            notifications,
        }
    }

    /// Access the identity store capability.
    pub fn identity_store(&self) -> &'a dyn IdentityStore {
        self.identity_store
    }

    /// Post a notification, best-effort. Failures never fail the
    /// owning transaction; they are logged and swallowed here.
    pub async fn notify(&self, notification: Notification) {
        if let Err(err) = self.notifications.post(notification).await {
            warn!(error = %err, "notification sink failed, continuing");
        }
    }

    /// A fresh instance id, for steps that start follow-up protocols.
    pub fn fresh_instance_id(&self) -> InstanceId {
        InstanceId::generate()
    }
}

/// One state-transition rule of a protocol.
///
/// A step is annotated with the channel kind its triggering message
/// must have arrived on; its body is a pure function of (state,
/// message, context) producing the next state and the outbound
/// message list.
#[async_trait]
pub trait ProtocolStep<P: Protocol>: Send + Sync {
    /// Human-readable step name for diagnostics.
    fn name(&self) -> &'static str;

    /// The channel kind the triggering message must have arrived on.
    fn required_channel(&self) -> ChannelRequirement;

    /// Execute the transition.
    ///
    /// # Errors
    ///
    /// [`StepError::Recoverable`] rolls the transaction back and
    /// leaves the message buffered; [`StepError::Invariant`] drives
    /// the instance to its aborted terminal state.
    async fn execute(
        &self,
        state: &P::State,
        payload: &P::Payload,
        ctx: &StepContext<'_>,
    ) -> StepResult<Transition<P::State>>;
}

/// A concrete protocol definition.
pub trait Protocol: Sized + Send + Sync + 'static {
    /// The protocol's wire identifier.
    const ID: ProtocolId;
    /// The protocol's diagnostic name.
    const NAME: &'static str;

    /// The protocol's state machine.
    type State: ProtocolState;
    /// The protocol's message set.
    type Payload: ProtocolPayload;

    /// Fixed configuration for instances of this protocol.
    fn config() -> ProtocolConfig;

    /// Candidate steps for one (state shape, message type) pair, in
    /// declaration order. An empty vector means no step currently
    /// accepts the message (it may be buffered).
    fn candidate_steps(
        state: &Self::State,
        payload: &Self::Payload,
    ) -> Vec<Box<dyn ProtocolStep<Self>>>;
}

/// A protocol state in its persisted, type-erased form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedState {
    /// Tag of the state shape.
    pub id: StateId,
    /// The codec-encoded state data.
    pub bytes: Vec<u8>,
}

/// What one dispatch attempt produced.
pub enum AttemptOutcome {
    /// A step executed; the transition awaits commit.
    Applied {
        /// The encoded next state.
        next: EncodedState,
        /// Whether the next state is terminal.
        terminal: bool,
        /// Outbound intents produced by the step.
        outbound: Vec<OutboundIntent>,
    },
    /// No candidate step exists for the current (state, message)
    /// pair.
    NoStep {
        /// Whether the *current* state is terminal, in which case no
        /// later transition can ever accept the message either.
        current_terminal: bool,
    },
    /// Candidates exist, but the message's arrival channel satisfies
    /// none of them.
    ChannelRejected(ChannelViolation),
    /// The payload failed strict decoding against the protocol's
    /// message shapes.
    Malformed(CodecError),
    /// The selected step failed.
    Failed {
        /// The failing step's name.
        step: &'static str,
        /// The failure.
        error: StepError,
    },
}

/// Object-safe face of a registered protocol.
///
/// Erases the concrete state and payload types so the engine can
/// drive any protocol through one interface.
#[async_trait]
pub trait ProtocolRunner: Send + Sync {
    /// The protocol's wire identifier.
    fn id(&self) -> ProtocolId;

    /// The protocol's diagnostic name.
    fn name(&self) -> &'static str;

    /// The protocol's configuration.
    fn config(&self) -> ProtocolConfig;

    /// The encoded initial state for newly created instances.
    fn initial_state(&self) -> EncodedState;

    /// The encoded terminal state an invariant violation drives the
    /// instance to.
    fn aborted_state(&self) -> EncodedState;

    /// Try to execute one step for `inbound` against `state`.
    async fn attempt(
        &self,
        state: &EncodedState,
        inbound: &InboundMessage,
        selector: &ChannelSelector,
        identity_store: &dyn IdentityStore,
        notifications: &dyn NotificationSink,
    ) -> AttemptOutcome;
}

struct ProtocolAdapter<P: Protocol> {
    _marker: PhantomData<fn() -> P>,
}

impl<P: Protocol> ProtocolAdapter<P> {
    fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn encode_state(state: &P::State) -> EncodedState {
        EncodedState {
            id: state.state_id(),
            bytes: encode(&state.to_value()),
        }
    }
}

#[async_trait]
impl<P: Protocol> ProtocolRunner for ProtocolAdapter<P> {
    fn id(&self) -> ProtocolId {
        P::ID
    }

    fn name(&self) -> &'static str {
        P::NAME
    }

    fn config(&self) -> ProtocolConfig {
        P::config()
    }

    fn initial_state(&self) -> EncodedState {
        Self::encode_state(&P::State::initial())
    }

    fn aborted_state(&self) -> EncodedState {
        Self::encode_state(&P::State::aborted())
    }

    async fn attempt(
        &self,
        state: &EncodedState,
        inbound: &InboundMessage,
        selector: &ChannelSelector,
        identity_store: &dyn IdentityStore,
        notifications: &dyn NotificationSink,
    ) -> AttemptOutcome {
        // The stored state was written by this engine; failing to
        // decode it is corruption, not a hostile message.
        let current = match decode(&state.bytes)
            .and_then(|value| P::State::from_value(state.id, &value))
        {
            Ok(current) => current,
            Err(err) => {
                return AttemptOutcome::Failed {
                    step: "state-decode",
                    error: StepError::Invariant(format!("stored state is undecodable: {err}")),
                }
            }
        };

        let payload = match P::Payload::from_value(inbound.envelope.tag, &inbound.envelope.payload)
        {
            Ok(payload) => payload,
            Err(err) => return AttemptOutcome::Malformed(err),
        };

        let candidates = P::candidate_steps(&current, &payload);
        if candidates.is_empty() {
            return AttemptOutcome::NoStep {
                current_terminal: current.is_terminal(),
            };
        }

        let owned = inbound.envelope.recipient;
        let mut selected = None;
        let mut first_violation = None;
        for candidate in candidates {
            let verdict = match selector
                .validate_on_receive(candidate.required_channel(), inbound, owned, identity_store)
                .await
            {
                Ok(verdict) => verdict,
                Err(err) => {
                    return AttemptOutcome::Failed {
                        step: "channel-validation",
                        error: StepError::from(err),
                    }
                }
            };
            match verdict {
                Ok(()) if selected.is_none() => selected = Some(candidate),
                Ok(()) => {
                    // A well-formed protocol never lets two candidates
                    // pass for one arrival channel.
                    warn!(
                        protocol = P::NAME,
                        "multiple candidate steps passed channel validation, \
                         keeping the first by declaration order"
                    );
                    debug_assert!(false, "ambiguous candidate steps in {}", P::NAME);
                }
                Err(violation) => {
                    first_violation.get_or_insert(violation);
                }
            }
        }

        let Some(step) = selected else {
            // first_violation is always set here: candidates was
            // non-empty and none were selected.
            return AttemptOutcome::ChannelRejected(
                first_violation.unwrap_or(ChannelViolation::KindMismatch),
            );
        };

        let ctx = StepContext::new(
            owned,
            inbound.envelope.sender,
            P::ID,
            inbound.envelope.instance,
            identity_store,
            notifications,
        );
        match step.execute(&current, &payload, &ctx).await {
            Ok(transition) => AttemptOutcome::Applied {
                terminal: transition.next_state.is_terminal(),
                next: Self::encode_state(&transition.next_state),
                outbound: transition.outbound,
            },
            Err(error) => AttemptOutcome::Failed {
                step: step.name(),
                error,
            },
        }
    }
}

/// Maps protocol ids to their registered runners.
#[derive(Default)]
pub struct ProtocolRegistry {
    runners: HashMap<ProtocolId, Arc<dyn ProtocolRunner>>,
}

impl ProtocolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol. Re-registering an id replaces the
    /// previous runner (a configuration defect; asserted in debug
    /// builds).
    pub fn register<P: Protocol>(&mut self) -> &mut Self {
        let previous = self
            .runners
            .insert(P::ID, Arc::new(ProtocolAdapter::<P>::new()));
        debug_assert!(
            previous.is_none(),
            "protocol id {:?} registered twice",
            P::ID
        );
        self
    }

    /// Look up the runner for a protocol id.
    pub fn runner(&self, id: ProtocolId) -> Option<Arc<dyn ProtocolRunner>> {
        self.runners.get(&id).cloned()
    }

    /// Number of registered protocols.
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    /// Whether no protocol is registered.
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
