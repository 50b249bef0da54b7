//! The protocol execution engine.
//!
//! One [`Engine`] instance serves one device. It owns the protocol
//! registry and drives every instance through the same loop: load or
//! create the instance under its per-instance lock, let the registered
//! runner attempt exactly one step, commit the transition, then (lock
//! released) resolve and deliver the step's outbound messages.
//!
//! ## Transaction boundaries
//!
//! A step either fully happens or leaves no trace. The commit to the
//! instance store is the boundary: outbound delivery and buffered
//! message reprocessing happen strictly after it, so a crash between
//! commit and delivery loses messages but never corrupts state. Peers
//! recover from lost messages by retransmission; nothing recovers from
//! a half-applied transition.
//!
//! ## Buffered message reprocessing
//!
//! After every applied transition the engine drains the instance's
//! buffer: messages that arrived too early are retried against the new
//! state, repeatedly, until a full pass applies nothing more. A
//! buffered message leaves the store only through the commit of the
//! cycle that consumes it, so a store failure mid-drain leaves every
//! unconsumed message in place for the next attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelSelector, ReceptionChannel};
use crate::error::{DropReason, EngineError, Outcome, StepError};
use crate::message::{InboundMessage, MessageEnvelope, OutboundIntent};
use crate::ports::{ChannelTransport, IdentityStore, NotificationSink};
use crate::registry::{AttemptOutcome, EncodedState, Protocol, ProtocolPayload, ProtocolRegistry};
use crate::store::{InstanceRecord, InstanceStore, StoredMessage};
use crate::types::{IdentityId, InstanceId, InstanceKey};

/// The protocol execution engine for one device.
pub struct Engine {
    registry: ProtocolRegistry,
    store: Arc<dyn InstanceStore>,
    identity_store: Arc<dyn IdentityStore>,
    transport: Arc<dyn ChannelTransport>,
    notifications: Arc<dyn NotificationSink>,
    selector: ChannelSelector,
    locks: StdMutex<HashMap<InstanceKey, Arc<Mutex<()>>>>,
}

impl Engine {
    /// Assemble an engine from its registry and collaborators.
    pub fn new(
        registry: ProtocolRegistry,
        store: Arc<dyn InstanceStore>,
        identity_store: Arc<dyn IdentityStore>,
        transport: Arc<dyn ChannelTransport>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            registry,
            store,
            identity_store,
            transport,
            notifications,
            selector: ChannelSelector,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Start a new instance of `P` with a locally triggered message.
    ///
    /// Builds a self-addressed envelope around `payload`, injects it
    /// over the local channel, and returns the fresh instance id with
    /// the processing outcome.
    ///
    /// # Errors
    ///
    /// Propagates step and store failures exactly like
    /// [`Engine::process`].
    pub async fn start<P: Protocol>(
        &self,
        owned: IdentityId,
        payload: &P::Payload,
    ) -> Result<(InstanceId, Outcome), EngineError> {
        let instance = InstanceId::generate();
        let outcome = self.inject_local::<P>(owned, instance, payload).await?;
        Ok((instance, outcome))
    }

    /// Inject a locally triggered message into an existing instance of
    /// `P`, such as a user's answer to a dialog.
    ///
    /// # Errors
    ///
    /// Propagates step and store failures exactly like
    /// [`Engine::process`].
    pub async fn inject_local<P: Protocol>(
        &self,
        owned: IdentityId,
        instance: InstanceId,
        payload: &P::Payload,
    ) -> Result<Outcome, EngineError> {
        let envelope = MessageEnvelope {
            protocol: P::ID,
            instance,
            tag: payload.tag(),
            sender: owned,
            recipient: owned,
            payload: payload.to_value(),
        };
        self.process(InboundMessage {
            envelope,
            channel: ReceptionChannel::Local,
        })
        .await
    }

    /// Process one inbound message to completion: at most one step
    /// execution, the commit, outbound delivery, and reprocessing of
    /// any buffered messages the transition unlocked.
    ///
    /// # Errors
    ///
    /// [`EngineError::RecoverableStepFailure`] and
    /// [`EngineError::Store`] leave the message buffered for a later
    /// retry; [`EngineError::InvariantViolation`] leaves the instance
    /// in its aborted terminal state. Hostile or unroutable messages
    /// are not errors; they surface as [`Outcome::Dropped`].
    pub async fn process(&self, inbound: InboundMessage) -> Result<Outcome, EngineError> {
        let key = inbound.envelope.instance_key();
        let result = self.process_one(inbound, None).await;
        if matches!(result, Ok(Outcome::Applied { .. })) {
            self.drain_buffered(&key).await;
        }
        self.reap_lock(&key);
        result
    }

    /// One load-attempt-commit-deliver cycle, without buffer draining.
    ///
    /// `replayed` marks a message taken back out of the instance's
    /// buffer. It is dropped from the working buffer here, so any
    /// commit below removes it durably; a cycle that fails before a
    /// commit leaves it buffered.
    async fn process_one(
        &self,
        inbound: InboundMessage,
        replayed: Option<&StoredMessage>,
    ) -> Result<Outcome, EngineError> {
        let key = inbound.envelope.instance_key();
        let Some(runner) = self.registry.runner(key.protocol) else {
            warn!(protocol = ?key.protocol, "message for unregistered protocol, dropping");
            return Ok(Outcome::Dropped(DropReason::UnknownProtocol(key.protocol)));
        };

        let guard = self.instance_lock(&key).lock_owned().await;

        let record = self.store.load_for_update(&key).await?;
        let is_new = record.is_none();
        let (state, mut buffered) = match record {
            Some(record) => (
                EncodedState {
                    id: record.state_id,
                    bytes: record.state_bytes,
                },
                record.buffered,
            ),
            None => (runner.initial_state(), Vec::new()),
        };
        if let Some(original) = replayed {
            buffered.retain(|stored| stored != original);
        }

        let attempt = runner
            .attempt(
                &state,
                &inbound,
                &self.selector,
                self.identity_store.as_ref(),
                self.notifications.as_ref(),
            )
            .await;

        match attempt {
            AttemptOutcome::Applied {
                next,
                terminal,
                outbound,
            } => {
                let owned = key.owner;
                let new_state = next.id;
                if terminal {
                    info!(
                        protocol = runner.name(),
                        instance = %key.instance,
                        state = ?new_state,
                        "instance reached terminal state"
                    );
                    if runner.config().erase_on_final {
                        if !is_new {
                            self.store.erase(&key).await?;
                        }
                    } else {
                        self.persist(&key, is_new, next, buffered).await?;
                    }
                } else {
                    self.persist(&key, is_new, next, buffered).await?;
                }
                drop(guard);
                self.deliver(owned, &outbound).await;
                Ok(Outcome::Applied {
                    new_state,
                    terminal,
                    outbound: outbound.len(),
                })
            }
            AttemptOutcome::NoStep { current_terminal } => {
                if current_terminal {
                    debug!(
                        protocol = runner.name(),
                        instance = %key.instance,
                        "message for finished instance, dropping"
                    );
                    if replayed.is_some() && !is_new {
                        self.persist(&key, false, state, buffered).await?;
                    }
                    Ok(Outcome::Dropped(DropReason::InstanceFinished))
                } else {
                    self.buffer(&key, is_new, state, buffered, &inbound).await?;
                    Ok(Outcome::Buffered)
                }
            }
            AttemptOutcome::ChannelRejected(violation) => {
                warn!(
                    protocol = runner.name(),
                    instance = %key.instance,
                    sender = %inbound.envelope.sender,
                    violation = ?violation,
                    "arrival channel inconsistent with every candidate step, \
                     dropping potential attack"
                );
                if replayed.is_some() && !is_new {
                    self.persist(&key, false, state, buffered).await?;
                }
                Ok(Outcome::Dropped(DropReason::ChannelMismatch))
            }
            AttemptOutcome::Malformed(err) => {
                warn!(
                    protocol = runner.name(),
                    instance = %key.instance,
                    error = %err,
                    "malformed payload, dropping"
                );
                Ok(Outcome::Dropped(DropReason::Malformed(err)))
            }
            AttemptOutcome::Failed {
                step,
                error: StepError::Recoverable(reason),
            } => {
                debug!(
                    protocol = runner.name(),
                    step,
                    reason = %reason,
                    "step failed transiently, keeping message buffered"
                );
                self.buffer(&key, is_new, state, buffered, &inbound).await?;
                Err(EngineError::RecoverableStepFailure { step, reason })
            }
            AttemptOutcome::Failed {
                step,
                error: StepError::Invariant(reason),
            } => {
                error!(
                    protocol = runner.name(),
                    instance = %key.instance,
                    step,
                    reason = %reason,
                    "invariant violation, driving instance to aborted state"
                );
                if runner.config().erase_on_final {
                    if !is_new {
                        self.store.erase(&key).await?;
                    }
                } else {
                    self.persist(&key, is_new, runner.aborted_state(), buffered)
                        .await?;
                }
                Err(EngineError::InvariantViolation { step, reason })
            }
        }
    }

    /// Retry buffered messages against the instance's new state until
    /// a full pass applies nothing. Every applied message was removed
    /// from the durable buffer by its own commit, so each productive
    /// pass strictly shrinks the buffer and the loop terminates.
    async fn drain_buffered(&self, key: &InstanceKey) {
        loop {
            let pending = match self.peek_buffered(key).await {
                Ok(pending) => pending,
                Err(err) => {
                    warn!(error = %err, "could not read buffered messages, retry on next delivery");
                    return;
                }
            };
            if pending.is_empty() {
                return;
            }

            let mut progressed = false;
            for stored in pending {
                let envelope = match MessageEnvelope::from_bytes(&stored.envelope_bytes) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(error = %err, "buffered message is undecodable, discarding");
                        self.discard_buffered(key, &stored).await;
                        continue;
                    }
                };
                let inbound = InboundMessage {
                    envelope,
                    channel: stored.channel,
                };
                match self.process_one(inbound, Some(&stored)).await {
                    Ok(Outcome::Applied { .. }) => progressed = true,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "buffered message still not consumable");
                    }
                }
            }
            if !progressed {
                return;
            }
        }
    }

    /// Snapshot the instance's buffered messages without consuming
    /// them.
    async fn peek_buffered(&self, key: &InstanceKey) -> Result<Vec<StoredMessage>, EngineError> {
        let _guard = self.instance_lock(key).lock_owned().await;
        Ok(self
            .store
            .load_for_update(key)
            .await?
            .map(|record| record.buffered)
            .unwrap_or_default())
    }

    /// Drop one undecodable entry from the durable buffer, best
    /// effort.
    async fn discard_buffered(&self, key: &InstanceKey, stored: &StoredMessage) {
        let _guard = self.instance_lock(key).lock_owned().await;
        let mut record = match self.store.load_for_update(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "could not discard undecodable buffered message");
                return;
            }
        };
        record.buffered.retain(|kept| kept != stored);
        if let Err(err) = self.store.commit(key, record).await {
            warn!(error = %err, "could not discard undecodable buffered message");
        }
    }

    async fn persist(
        &self,
        key: &InstanceKey,
        is_new: bool,
        state: EncodedState,
        buffered: Vec<StoredMessage>,
    ) -> Result<(), EngineError> {
        let record = InstanceRecord {
            state_id: state.id,
            state_bytes: state.bytes,
            buffered,
        };
        if is_new {
            self.store.create(key, record).await?;
        } else {
            self.store.commit(key, record).await?;
        }
        Ok(())
    }

    async fn buffer(
        &self,
        key: &InstanceKey,
        is_new: bool,
        state: EncodedState,
        mut buffered: Vec<StoredMessage>,
        inbound: &InboundMessage,
    ) -> Result<(), EngineError> {
        let stored = StoredMessage {
            envelope_bytes: inbound.envelope.to_bytes(),
            channel: inbound.channel,
        };
        // Re-buffering an already-buffered message (drain retry that
        // still cannot apply) must not duplicate it.
        if !buffered.contains(&stored) {
            buffered.push(stored);
        }
        self.persist(key, is_new, state, buffered).await
    }

    /// Resolve and deliver each outbound intent. Runs strictly after
    /// the owning commit; delivery failures are logged, never bubbled,
    /// since peers recover by retransmission.
    async fn deliver(&self, owned: IdentityId, outbound: &[OutboundIntent]) {
        for intent in outbound {
            let channels = match self
                .selector
                .resolve_for_send(
                    intent.intent,
                    owned,
                    self.identity_store.as_ref(),
                    self.transport.as_ref(),
                )
                .await
            {
                Ok(channels) => channels,
                Err(err) => {
                    warn!(error = %err, "channel resolution failed, dropping outbound message");
                    continue;
                }
            };
            for channel in channels {
                if let Err(err) = self.transport.send(intent.envelope.clone(), channel).await {
                    warn!(
                        error = %err,
                        channel = ?channel,
                        "outbound delivery failed, relying on peer retransmission"
                    );
                }
            }
        }
    }

    fn instance_lock(&self, key: &InstanceKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(*key).or_default().clone()
    }

    /// Remove the lock entry for `key` once no task holds a handle to
    /// it. The entry must stay while any clone is live: a waiter
    /// queued on the old mutex and a later arrival handed a fresh one
    /// would no longer exclude each other.
    fn reap_lock(&self, key: &InstanceKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::ports::{PortError, PortResult};
    use crate::test_protocol::{
        CounterPayload, CounterProtocol, RetainedCounterProtocol, SlowCounterProtocol, ADD,
        SLOW_MAX_IN_FLIGHT,
    };
    use crate::testkit::{MockIdentityStore, RecordingNotifications, RecordingTransport};
    use crate::types::{MessageTag, ProtocolId, StateId};
    use crate::MemoryInstanceStore;
    use obelisk_codec::Value;

    struct Fixture {
        engine: Arc<Engine>,
        store: Arc<MemoryInstanceStore>,
    }

    fn fixture() -> Fixture {
        let mut registry = ProtocolRegistry::new();
        registry.register::<CounterProtocol>();
        registry.register::<RetainedCounterProtocol>();
        let store = Arc::new(MemoryInstanceStore::new());
        let engine = Arc::new(Engine::new(
            registry,
            store.clone(),
            Arc::new(MockIdentityStore::new()),
            Arc::new(RecordingTransport::new()),
            Arc::new(RecordingNotifications::new()),
        ));
        Fixture { engine, store }
    }

    fn owner() -> IdentityId {
        IdentityId::from_bytes([1; 32])
    }

    #[tokio::test]
    async fn happy_path_erases_finished_instance() {
        let fx = fixture();
        let (instance, outcome) = fx
            .engine
            .start::<CounterProtocol>(owner(), &CounterPayload::Start)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Applied {
                new_state: StateId(1),
                terminal: false,
                outbound: 0,
            }
        );

        fx.engine
            .inject_local::<CounterProtocol>(owner(), instance, &CounterPayload::Add { n: 5 })
            .await
            .unwrap();
        let outcome = fx
            .engine
            .inject_local::<CounterProtocol>(owner(), instance, &CounterPayload::Finish)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Applied {
                new_state: StateId(2),
                terminal: true,
                outbound: 0,
            }
        );
        assert!(fx.store.is_empty().await);
    }

    #[tokio::test]
    async fn retained_protocol_keeps_terminal_record() {
        let fx = fixture();
        let (instance, _) = fx
            .engine
            .start::<RetainedCounterProtocol>(owner(), &CounterPayload::Start)
            .await
            .unwrap();
        fx.engine
            .inject_local::<RetainedCounterProtocol>(owner(), instance, &CounterPayload::Finish)
            .await
            .unwrap();

        let key = InstanceKey {
            protocol: RetainedCounterProtocol::ID,
            instance,
            owner: owner(),
        };
        let record = fx.store.load_for_update(&key).await.unwrap().unwrap();
        assert_eq!(record.state_id, StateId(2));

        // Late messages for the finished instance are dropped, not
        // buffered.
        let outcome = fx
            .engine
            .inject_local::<RetainedCounterProtocol>(
                owner(),
                instance,
                &CounterPayload::Add { n: 1 },
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Dropped(DropReason::InstanceFinished));
    }

    #[tokio::test]
    async fn early_message_is_buffered_then_replayed() {
        let fx = fixture();
        let instance = InstanceId::generate();

        // Add arrives before Start, so no step accepts it yet.
        let outcome = fx
            .engine
            .inject_local::<CounterProtocol>(owner(), instance, &CounterPayload::Add { n: 7 })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Buffered);

        let key = InstanceKey {
            protocol: CounterProtocol::ID,
            instance,
            owner: owner(),
        };
        let record = fx.store.load_for_update(&key).await.unwrap().unwrap();
        assert_eq!(record.buffered.len(), 1);

        // Start unlocks it: the drain replays the buffered Add.
        fx.engine
            .inject_local::<CounterProtocol>(owner(), instance, &CounterPayload::Start)
            .await
            .unwrap();
        let record = fx.store.load_for_update(&key).await.unwrap().unwrap();
        assert_eq!(record.state_id, StateId(1));
        assert!(record.buffered.is_empty());
        assert_eq!(
            obelisk_codec::decode(&record.state_bytes).unwrap(),
            Value::List(vec![Value::U64(7)])
        );
    }

    #[tokio::test]
    async fn concurrent_adds_are_serialized_per_instance() {
        let fx = fixture();
        let (instance, _) = fx
            .engine
            .start::<RetainedCounterProtocol>(owner(), &CounterPayload::Start)
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let engine = fx.engine.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .inject_local::<RetainedCounterProtocol>(
                        owner(),
                        instance,
                        &CounterPayload::Add { n: 1 },
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let key = InstanceKey {
            protocol: RetainedCounterProtocol::ID,
            instance,
            owner: owner(),
        };
        let record = fx.store.load_for_update(&key).await.unwrap().unwrap();
        assert_eq!(
            obelisk_codec::decode(&record.state_bytes).unwrap(),
            Value::List(vec![Value::U64(16)])
        );
    }

    #[tokio::test]
    async fn recoverable_failure_rolls_back_and_buffers() {
        let fx = fixture();
        let (instance, _) = fx
            .engine
            .start::<CounterProtocol>(owner(), &CounterPayload::Start)
            .await
            .unwrap();

        let err = fx
            .engine
            .inject_local::<CounterProtocol>(owner(), instance, &CounterPayload::FailTransient)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RecoverableStepFailure { .. }));

        let key = InstanceKey {
            protocol: CounterProtocol::ID,
            instance,
            owner: owner(),
        };
        let record = fx.store.load_for_update(&key).await.unwrap().unwrap();
        assert_eq!(record.state_id, StateId(1));
        assert_eq!(record.buffered.len(), 1);
    }

    #[tokio::test]
    async fn invariant_violation_aborts_the_instance() {
        let fx = fixture();

        // Erasing protocol: the broken instance disappears entirely.
        let (instance, _) = fx
            .engine
            .start::<CounterProtocol>(owner(), &CounterPayload::Start)
            .await
            .unwrap();
        let err = fx
            .engine
            .inject_local::<CounterProtocol>(owner(), instance, &CounterPayload::BreakInvariant)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation { .. }));
        assert!(fx.store.is_empty().await);

        // Retaining protocol: the instance lands in its aborted state.
        let (instance, _) = fx
            .engine
            .start::<RetainedCounterProtocol>(owner(), &CounterPayload::Start)
            .await
            .unwrap();
        fx.engine
            .inject_local::<RetainedCounterProtocol>(
                owner(),
                instance,
                &CounterPayload::BreakInvariant,
            )
            .await
            .unwrap_err();
        let key = InstanceKey {
            protocol: RetainedCounterProtocol::ID,
            instance,
            owner: owner(),
        };
        let record = fx.store.load_for_update(&key).await.unwrap().unwrap();
        assert_eq!(record.state_id, StateId(3));
    }

    /// Store wrapper that fails exactly one `load_for_update` call.
    struct FlakyStore {
        inner: MemoryInstanceStore,
        loads: AtomicU32,
        fail_on: u32,
    }

    impl FlakyStore {
        fn failing_load(fail_on: u32) -> Self {
            Self {
                inner: MemoryInstanceStore::new(),
                loads: AtomicU32::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl InstanceStore for FlakyStore {
        async fn load_for_update(&self, key: &InstanceKey) -> PortResult<Option<InstanceRecord>> {
            let call = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on {
                return Err(PortError::Unavailable("injected outage".to_owned()));
            }
            self.inner.load_for_update(key).await
        }

        async fn create(&self, key: &InstanceKey, record: InstanceRecord) -> PortResult<()> {
            self.inner.create(key, record).await
        }

        async fn commit(&self, key: &InstanceKey, record: InstanceRecord) -> PortResult<()> {
            self.inner.commit(key, record).await
        }

        async fn erase(&self, key: &InstanceKey) -> PortResult<()> {
            self.inner.erase(key).await
        }
    }

    #[tokio::test]
    async fn store_outage_during_drain_keeps_the_buffered_message() {
        // The fourth load is the drain's reload of the replayed
        // message, right after Start commits.
        let store = Arc::new(FlakyStore::failing_load(4));
        let mut registry = ProtocolRegistry::new();
        registry.register::<CounterProtocol>();
        let engine = Engine::new(
            registry,
            store.clone(),
            Arc::new(MockIdentityStore::new()),
            Arc::new(RecordingTransport::new()),
            Arc::new(RecordingNotifications::new()),
        );
        let instance = InstanceId::generate();

        engine
            .inject_local::<CounterProtocol>(owner(), instance, &CounterPayload::Add { n: 7 })
            .await
            .unwrap();
        engine
            .inject_local::<CounterProtocol>(owner(), instance, &CounterPayload::Start)
            .await
            .unwrap();

        // The outage interrupted the drain; the early Add must still
        // be buffered.
        let key = InstanceKey {
            protocol: CounterProtocol::ID,
            instance,
            owner: owner(),
        };
        let record = store.load_for_update(&key).await.unwrap().unwrap();
        assert_eq!(record.state_id, StateId(1));
        assert_eq!(record.buffered.len(), 1);

        // The store recovered; the next transition replays it.
        engine
            .inject_local::<CounterProtocol>(owner(), instance, &CounterPayload::Add { n: 1 })
            .await
            .unwrap();
        let record = store.load_for_update(&key).await.unwrap().unwrap();
        assert!(record.buffered.is_empty());
        assert_eq!(
            obelisk_codec::decode(&record.state_bytes).unwrap(),
            Value::List(vec![Value::U64(8)])
        );
    }

    #[tokio::test]
    async fn arrivals_after_terminal_erase_stay_serialized() {
        let mut registry = ProtocolRegistry::new();
        registry.register::<SlowCounterProtocol>();
        let engine = Arc::new(Engine::new(
            registry,
            Arc::new(MemoryInstanceStore::new()),
            Arc::new(MockIdentityStore::new()),
            Arc::new(RecordingTransport::new()),
            Arc::new(RecordingNotifications::new()),
        ));
        let instance = InstanceId::generate();

        // Three slow finishes: the first erases the instance while the
        // second already waits on the instance lock; the third arrives
        // after the erase and must queue behind the second.
        let mut tasks = Vec::new();
        for delay_ms in [0u64, 30, 200] {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                engine
                    .inject_local::<SlowCounterProtocol>(
                        owner(),
                        instance,
                        &CounterPayload::Finish,
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(SLOW_MAX_IN_FLIGHT.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_protocol_is_dropped() {
        let fx = fixture();
        let envelope = MessageEnvelope {
            protocol: ProtocolId(0x0BAD),
            instance: InstanceId::generate(),
            tag: MessageTag(0),
            sender: owner(),
            recipient: owner(),
            payload: Value::List(Vec::new()),
        };
        let outcome = fx
            .engine
            .process(InboundMessage {
                envelope,
                channel: ReceptionChannel::Local,
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Dropped(DropReason::UnknownProtocol(ProtocolId(0x0BAD)))
        );
        assert!(fx.store.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_tag_is_dropped_as_malformed() {
        let fx = fixture();
        let (instance, _) = fx
            .engine
            .start::<CounterProtocol>(owner(), &CounterPayload::Start)
            .await
            .unwrap();
        let envelope = MessageEnvelope {
            protocol: CounterProtocol::ID,
            instance,
            tag: MessageTag(99),
            sender: owner(),
            recipient: owner(),
            payload: Value::List(Vec::new()),
        };
        let outcome = fx
            .engine
            .process(InboundMessage {
                envelope,
                channel: ReceptionChannel::Local,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Dropped(DropReason::Malformed(_))));

        // The instance itself is untouched.
        let key = InstanceKey {
            protocol: CounterProtocol::ID,
            instance,
            owner: owner(),
        };
        let record = fx.store.load_for_update(&key).await.unwrap().unwrap();
        assert_eq!(record.state_id, StateId(1));
        assert!(record.buffered.is_empty());
    }

    #[tokio::test]
    async fn spoofed_local_trigger_is_rejected() {
        let fx = fixture();
        let mallory = IdentityId::from_bytes([9; 32]);
        let (instance, _) = fx
            .engine
            .start::<CounterProtocol>(owner(), &CounterPayload::Start)
            .await
            .unwrap();

        // A network arrival claiming a local-only trigger.
        let envelope = MessageEnvelope {
            protocol: CounterProtocol::ID,
            instance,
            tag: ADD,
            sender: owner(),
            recipient: owner(),
            payload: Value::List(vec![Value::U64(1)]),
        };
        let outcome = fx
            .engine
            .process(InboundMessage {
                envelope,
                channel: ReceptionChannel::SecureChannel {
                    remote_identity: mallory,
                    remote_device: crate::DeviceId::from_bytes([7; 32]),
                },
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Dropped(DropReason::ChannelMismatch));

        let key = InstanceKey {
            protocol: CounterProtocol::ID,
            instance,
            owner: owner(),
        };
        let record = fx.store.load_for_update(&key).await.unwrap().unwrap();
        assert_eq!(
            obelisk_codec::decode(&record.state_bytes).unwrap(),
            Value::List(vec![Value::U64(0)])
        );
    }
}
