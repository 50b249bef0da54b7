//! Error taxonomy and processing outcomes.
//!
//! Decode and channel errors are handled entirely inside the engine
//! and reported through [`Outcome::Dropped`]; they never surface as
//! `Err` to callers. Only [`EngineError::RecoverableStepFailure`] and
//! [`EngineError::InvariantViolation`] (plus store unavailability,
//! which is treated as recoverable) surface from
//! [`Engine::process`](crate::Engine::process) for observability.

use thiserror::Error;

use obelisk_codec::CodecError;

use crate::ports::PortError;
use crate::types::{ProtocolId, StateId};

/// Errors surfaced by the execution engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A step failed for a transient reason (e.g. a collaborator was
    /// unavailable). Nothing was committed; the triggering message
    /// remains buffered and is retried on the next delivery attempt.
    #[error("recoverable step failure in {step}: {reason}")]
    RecoverableStepFailure {
        /// The step that failed.
        step: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// An internal contract was broken (e.g. a required cryptographic
    /// key was unexpectedly absent). The engine logs loudly and drives
    /// the instance to a safe terminal state rather than leaving it
    /// stuck.
    #[error("invariant violation in {step}: {reason}")]
    InvariantViolation {
        /// The step that detected the breach.
        step: &'static str,
        /// The broken contract.
        reason: String,
    },

    /// The instance store itself failed. Treated like a recoverable
    /// step failure: nothing committed, message not consumed.
    #[error("instance store failure: {0}")]
    Store(#[from] PortError),
}

/// Why a message was dropped without mutating any state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The message failed strict decoding. Never retried.
    Malformed(CodecError),
    /// The message arrived over a channel inconsistent with every
    /// candidate step's requirement. Security-relevant; logged as a
    /// potential attack.
    ChannelMismatch,
    /// No runner is registered for the message's protocol id.
    UnknownProtocol(ProtocolId),
    /// The instance is already in a terminal state, so no future
    /// transition can ever consume the message.
    InstanceFinished,
}

/// The result of processing one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A step executed and the transition was committed.
    Applied {
        /// The state the instance transitioned to.
        new_state: StateId,
        /// Whether that state is terminal.
        terminal: bool,
        /// Number of outbound intents the step produced.
        outbound: usize,
    },
    /// No step currently accepts the message; it was buffered for a
    /// later transition attempt.
    Buffered,
    /// The message was discarded without touching any state.
    Dropped(DropReason),
}

/// Errors a step implementation can return.
#[derive(Error, Debug)]
pub enum StepError {
    /// Transient failure; the transaction rolls back and the message
    /// is retried later.
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// A should-never-happen internal contract breach; the engine
    /// drives the instance to its aborted terminal state.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl From<PortError> for StepError {
    fn from(err: PortError) -> Self {
        StepError::Recoverable(err.to_string())
    }
}

/// Convenience result type for step implementations.
pub type StepResult<T> = std::result::Result<T, StepError>;
