//! A minimal protocol exercising every engine path.
//!
//! The counter accepts a `Start`, any number of `Add`s, and a
//! `Finish`, plus two messages that fail on purpose. All steps are
//! locally triggered, so tests need no transport setup. `Add` before
//! `Start` has no candidate step and gets buffered.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use obelisk_codec::{CodecError, FieldReader, Value};

use crate::channel::ChannelRequirement;
use crate::error::{StepError, StepResult};
use crate::registry::{
    Protocol, ProtocolConfig, ProtocolPayload, ProtocolState, ProtocolStep, StepContext,
    Transition,
};
use crate::types::{MessageTag, ProtocolId, StateId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CounterState {
    Initial,
    Counting { total: u64 },
    Done { total: u64 },
    Aborted,
}

impl ProtocolState for CounterState {
    fn initial() -> Self {
        CounterState::Initial
    }

    fn aborted() -> Self {
        CounterState::Aborted
    }

    fn state_id(&self) -> StateId {
        match self {
            CounterState::Initial => StateId(0),
            CounterState::Counting { .. } => StateId(1),
            CounterState::Done { .. } => StateId(2),
            CounterState::Aborted => StateId(3),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, CounterState::Done { .. } | CounterState::Aborted)
    }

    fn to_value(&self) -> Value {
        match self {
            CounterState::Initial | CounterState::Aborted => Value::List(Vec::new()),
            CounterState::Counting { total } | CounterState::Done { total } => {
                Value::List(vec![Value::U64(*total)])
            }
        }
    }

    fn from_value(id: StateId, value: &Value) -> obelisk_codec::Result<Self> {
        match id.0 {
            0 => {
                FieldReader::new(value, 0)?;
                Ok(CounterState::Initial)
            }
            1 => {
                let fields = FieldReader::new(value, 1)?;
                Ok(CounterState::Counting {
                    total: fields.u64(0)?,
                })
            }
            2 => {
                let fields = FieldReader::new(value, 1)?;
                Ok(CounterState::Done {
                    total: fields.u64(0)?,
                })
            }
            3 => {
                FieldReader::new(value, 0)?;
                Ok(CounterState::Aborted)
            }
            other => Err(CodecError::UnknownMessageTag { tag: other }),
        }
    }
}

pub const START: MessageTag = MessageTag(0);
pub const ADD: MessageTag = MessageTag(1);
pub const FINISH: MessageTag = MessageTag(2);
pub const FAIL_TRANSIENT: MessageTag = MessageTag(3);
pub const BREAK_INVARIANT: MessageTag = MessageTag(4);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CounterPayload {
    Start,
    Add { n: u64 },
    Finish,
    FailTransient,
    BreakInvariant,
}

impl ProtocolPayload for CounterPayload {
    fn tag(&self) -> MessageTag {
        match self {
            CounterPayload::Start => START,
            CounterPayload::Add { .. } => ADD,
            CounterPayload::Finish => FINISH,
            CounterPayload::FailTransient => FAIL_TRANSIENT,
            CounterPayload::BreakInvariant => BREAK_INVARIANT,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            CounterPayload::Add { n } => Value::List(vec![Value::U64(*n)]),
            _ => Value::List(Vec::new()),
        }
    }

    fn from_value(tag: MessageTag, payload: &Value) -> obelisk_codec::Result<Self> {
        match tag {
            START => {
                FieldReader::new(payload, 0)?;
                Ok(CounterPayload::Start)
            }
            ADD => {
                let fields = FieldReader::new(payload, 1)?;
                Ok(CounterPayload::Add { n: fields.u64(0)? })
            }
            FINISH => {
                FieldReader::new(payload, 0)?;
                Ok(CounterPayload::Finish)
            }
            FAIL_TRANSIENT => {
                FieldReader::new(payload, 0)?;
                Ok(CounterPayload::FailTransient)
            }
            BREAK_INVARIANT => {
                FieldReader::new(payload, 0)?;
                Ok(CounterPayload::BreakInvariant)
            }
            other => Err(CodecError::UnknownMessageTag { tag: other.0 }),
        }
    }
}

// Steps are generic over the protocol type so the erasing and the
// retaining variants below can share them.

struct StartStep<P>(PhantomData<fn() -> P>);

#[async_trait]
impl<P> ProtocolStep<P> for StartStep<P>
where
    P: Protocol<State = CounterState, Payload = CounterPayload>,
{
    fn name(&self) -> &'static str {
        "start"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        _state: &CounterState,
        _payload: &CounterPayload,
        _ctx: &StepContext<'_>,
    ) -> StepResult<Transition<CounterState>> {
        Ok(Transition {
            next_state: CounterState::Counting { total: 0 },
            outbound: Vec::new(),
        })
    }
}

struct AddStep<P>(PhantomData<fn() -> P>);

#[async_trait]
impl<P> ProtocolStep<P> for AddStep<P>
where
    P: Protocol<State = CounterState, Payload = CounterPayload>,
{
    fn name(&self) -> &'static str {
        "add"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        state: &CounterState,
        payload: &CounterPayload,
        _ctx: &StepContext<'_>,
    ) -> StepResult<Transition<CounterState>> {
        let (CounterState::Counting { total }, CounterPayload::Add { n }) = (state, payload)
        else {
            return Err(StepError::Invariant("add outside counting".to_owned()));
        };
        Ok(Transition {
            next_state: CounterState::Counting { total: total + n },
            outbound: Vec::new(),
        })
    }
}

struct FinishStep<P>(PhantomData<fn() -> P>);

#[async_trait]
impl<P> ProtocolStep<P> for FinishStep<P>
where
    P: Protocol<State = CounterState, Payload = CounterPayload>,
{
    fn name(&self) -> &'static str {
        "finish"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        state: &CounterState,
        _payload: &CounterPayload,
        _ctx: &StepContext<'_>,
    ) -> StepResult<Transition<CounterState>> {
        let CounterState::Counting { total } = state else {
            return Err(StepError::Invariant("finish outside counting".to_owned()));
        };
        Ok(Transition {
            next_state: CounterState::Done { total: *total },
            outbound: Vec::new(),
        })
    }
}

struct FailTransientStep<P>(PhantomData<fn() -> P>);

#[async_trait]
impl<P> ProtocolStep<P> for FailTransientStep<P>
where
    P: Protocol<State = CounterState, Payload = CounterPayload>,
{
    fn name(&self) -> &'static str {
        "fail-transient"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        _state: &CounterState,
        _payload: &CounterPayload,
        _ctx: &StepContext<'_>,
    ) -> StepResult<Transition<CounterState>> {
        Err(StepError::Recoverable("injected transient failure".to_owned()))
    }
}

struct BreakInvariantStep<P>(PhantomData<fn() -> P>);

#[async_trait]
impl<P> ProtocolStep<P> for BreakInvariantStep<P>
where
    P: Protocol<State = CounterState, Payload = CounterPayload>,
{
    fn name(&self) -> &'static str {
        "break-invariant"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        _state: &CounterState,
        _payload: &CounterPayload,
        _ctx: &StepContext<'_>,
    ) -> StepResult<Transition<CounterState>> {
        Err(StepError::Invariant("injected invariant breach".to_owned()))
    }
}

fn counter_steps<P>(state: &CounterState, payload: &CounterPayload) -> Vec<Box<dyn ProtocolStep<P>>>
where
    P: Protocol<State = CounterState, Payload = CounterPayload>,
{
    match (state, payload) {
        (CounterState::Initial, CounterPayload::Start) => vec![Box::new(StartStep(PhantomData))],
        (CounterState::Counting { .. }, CounterPayload::Add { .. }) => {
            vec![Box::new(AddStep(PhantomData))]
        }
        (CounterState::Counting { .. }, CounterPayload::Finish) => {
            vec![Box::new(FinishStep(PhantomData))]
        }
        (CounterState::Counting { .. }, CounterPayload::FailTransient) => {
            vec![Box::new(FailTransientStep(PhantomData))]
        }
        (CounterState::Counting { .. }, CounterPayload::BreakInvariant) => {
            vec![Box::new(BreakInvariantStep(PhantomData))]
        }
        // Anything else (Add before Start, messages after a terminal
        // state) has no applicable step.
        _ => Vec::new(),
    }
}

/// Counter variant whose finished instances are erased.
pub struct CounterProtocol;

impl Protocol for CounterProtocol {
    const ID: ProtocolId = ProtocolId(0xFFFF);
    const NAME: &'static str = "counter-test";

    type State = CounterState;
    type Payload = CounterPayload;

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            erase_on_final: true,
        }
    }

    fn candidate_steps(
        state: &Self::State,
        payload: &Self::Payload,
    ) -> Vec<Box<dyn ProtocolStep<Self>>> {
        counter_steps(state, payload)
    }
}

/// Steps of [`SlowCounterProtocol`] currently executing.
pub static SLOW_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
/// High-water mark of [`SLOW_IN_FLIGHT`].
pub static SLOW_MAX_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

struct SlowFinishStep<P>(PhantomData<fn() -> P>);

#[async_trait]
impl<P> ProtocolStep<P> for SlowFinishStep<P>
where
    P: Protocol<State = CounterState, Payload = CounterPayload>,
{
    fn name(&self) -> &'static str {
        "slow-finish"
    }

    fn required_channel(&self) -> ChannelRequirement {
        ChannelRequirement::Local
    }

    async fn execute(
        &self,
        _state: &CounterState,
        _payload: &CounterPayload,
        _ctx: &StepContext<'_>,
    ) -> StepResult<Transition<CounterState>> {
        let running = SLOW_IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
        SLOW_MAX_IN_FLIGHT.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        SLOW_IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
        Ok(Transition {
            next_state: CounterState::Done { total: 0 },
            outbound: Vec::new(),
        })
    }
}

/// Counter variant whose `Finish` is slow, terminal and accepted from
/// any live state. Lets tests observe per-instance serialization
/// across a terminal erasure.
pub struct SlowCounterProtocol;

impl Protocol for SlowCounterProtocol {
    const ID: ProtocolId = ProtocolId(0xFFFD);
    const NAME: &'static str = "slow-counter-test";

    type State = CounterState;
    type Payload = CounterPayload;

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
            (
                CounterState::Initial | CounterState::Counting { .. },
                CounterPayload::Finish,
            ) => vec![Box::new(SlowFinishStep(PhantomData))],
            _ => counter_steps(state, payload),
        }
    }
}

/// Counter variant whose finished instances are kept.
pub struct RetainedCounterProtocol;

impl Protocol for RetainedCounterProtocol {
    const ID: ProtocolId = ProtocolId(0xFFFE);
    const NAME: &'static str = "retained-counter-test";

    type State = CounterState;
    type Payload = CounterPayload;

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            erase_on_final: false,
        }
    }

    fn candidate_steps(
        state: &Self::State,
        payload: &Self::Payload,
    ) -> Vec<Box<dyn ProtocolStep<Self>>> {
        counter_steps(state, payload)
    }
}
