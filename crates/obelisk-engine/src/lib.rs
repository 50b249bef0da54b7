//! # obelisk-engine
//!
//! Generic execution engine for multi-step, multi-party cryptographic
//! protocols over encrypted, possibly unordered, possibly multi-device
//! transport.
//!
//! The engine tracks per-protocol-instance state, matches inbound
//! messages to applicable transitions, executes at most one transition
//! per message atomically, and fans follow-up messages out to other
//! devices of the same identity or to remote parties over the correct
//! kind of secure channel.
//!
//! ## Data Flow
//!
//! ```text
//! inbound message
//!      │
//!      ▼
//! ChannelSelector ── validates the arrival channel against what the
//!      │              candidate step requires (fail-closed)
//!      ▼
//! Engine ─────────── loads or creates the ProtocolInstance under a
//!      │              per-instance lock
//!      ▼
//! ProtocolRegistry ─ yields candidate steps for the current
//!      │              (state shape, message tag) pair
//!      ▼
//! Step ───────────── pure transition: (state, message, context)
//!      │              -> next state + outbound intents
//!      ▼
//! InstanceStore ──── state committed, consumed message removed,
//!      │              terminal instances reaped
//!      ▼
//! ChannelTransport ─ outbound delivery, strictly after the commit
//! ```
//!
//! ## Concurrency
//!
//! Executions for the same instance are serialized by a keyed lock;
//! executions for different instances run fully in parallel. There is
//! no global lock. Steps hold the instance lock only while computing
//! the next state and the outbound message list; network delivery
//! happens after the lock is released.
//!
//! ## Collaborators
//!
//! The identity store, channel transport and notification sink are
//! external capabilities passed in as narrow traits ([`ports`]), never
//! global state, which keeps steps unit-testable in isolation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod engine;
pub mod error;
pub mod message;
pub mod ports;
pub mod registry;
pub mod store;
pub mod testkit;
pub mod types;

#[cfg(test)]
mod test_protocol;

pub use channel::{
    ChannelIntent, ChannelRequirement, ChannelSelector, ReceptionChannel, ResolvedChannel,
};
pub use engine::Engine;
pub use error::{DropReason, EngineError, Outcome, StepError, StepResult};
pub use message::{InboundMessage, MessageEnvelope, OutboundIntent};
pub use ports::{
    ChannelTransport, DeliveryHandle, IdentityStore, Notification, NotificationSink, PortError,
    PortResult, ProviderBinding,
};
pub use registry::{
    Protocol, ProtocolConfig, ProtocolPayload, ProtocolRegistry, ProtocolRunner, ProtocolState,
    ProtocolStep, StepContext, Transition,
};
pub use store::{InstanceRecord, InstanceStore, MemoryInstanceStore, StoredMessage};
pub use types::{DeviceId, IdentityId, InstanceId, InstanceKey, MessageTag, ProtocolId, StateId};
