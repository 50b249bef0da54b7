//! Protocol instance persistence.
//!
//! The store is the only mutable shared resource in this subsystem.
//! It maps an [`InstanceKey`] to the instance's current state and its
//! buffered, not-yet-consumed inbound messages.
//!
//! `load_for_update` and `commit` compose into a single atomic unit
//! because the engine serializes all executions for one instance key
//! behind a per-instance lock; implementations only need per-call
//! atomicity.
//!
//! ## Buffered messages
//!
//! A message can arrive before the instance has reached the state
//! that would let a step consume it (two network hops reordering).
//! Such messages stay buffered until a later transition consumes them
//! or the instance reaches a terminal state, where they are discarded
//! iff the protocol's `erase_on_final` configuration says so.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::channel::ReceptionChannel;
use crate::ports::{PortError, PortResult};
use crate::types::{InstanceKey, StateId};

/// An inbound message retained for a later transition attempt.
///
/// The envelope is kept in its encoded wire form together with what
/// the transport authenticated at arrival time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// The encoded [`MessageEnvelope`](crate::MessageEnvelope).
    pub envelope_bytes: Vec<u8>,
    /// The channel the message originally arrived on.
    pub channel: ReceptionChannel,
}

/// The persisted form of one protocol instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Tag of the current state shape.
    pub state_id: StateId,
    /// The current state, encoded with the message codec.
    pub state_bytes: Vec<u8>,
    /// Inbound messages no step has consumed yet.
    pub buffered: Vec<StoredMessage>,
}

/// Durable mapping from instance key to instance record.
///
/// Mutated only by the execution engine, under the engine's
/// per-instance lock.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Load the record for `key`, or `None` for a previously unseen
    /// instance.
    async fn load_for_update(&self, key: &InstanceKey) -> PortResult<Option<InstanceRecord>>;

    /// Create the record for a new instance.
    ///
    /// # Errors
    ///
    /// Fails if a record already exists for `key`.
    async fn create(&self, key: &InstanceKey, record: InstanceRecord) -> PortResult<()>;

    /// Replace the record for an existing instance: the new state and
    /// the full new buffered set (the engine removes consumed
    /// messages and appends newly buffered ones before committing).
    async fn commit(&self, key: &InstanceKey, record: InstanceRecord) -> PortResult<()>;

    /// Erase the instance and everything buffered for it.
    async fn erase(&self, key: &InstanceKey) -> PortResult<()>;
}

/// In-memory [`InstanceStore`].
///
/// The production backend is the host application's persistence
/// layer; this implementation backs tests and single-process use.
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    records: RwLock<HashMap<InstanceKey, InstanceRecord>>,
}

impl MemoryInstanceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live instances (test observability).
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no instances.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn load_for_update(&self, key: &InstanceKey) -> PortResult<Option<InstanceRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn create(&self, key: &InstanceKey, record: InstanceRecord) -> PortResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(key) {
            return Err(PortError::Other(format!(
                "instance already exists: {key:?}"
            )));
        }
        records.insert(*key, record);
        Ok(())
    }

    async fn commit(&self, key: &InstanceKey, record: InstanceRecord) -> PortResult<()> {
        let mut records = self.records.write().await;
        if !records.contains_key(key) {
            return Err(PortError::NotFound(format!("instance: {key:?}")));
        }
        records.insert(*key, record);
        Ok(())
    }

    async fn erase(&self, key: &InstanceKey) -> PortResult<()> {
        self.records.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IdentityId, InstanceId, ProtocolId};

    fn key() -> InstanceKey {
        InstanceKey {
            protocol: ProtocolId(1),
            instance: InstanceId::from_bytes([1; 32]),
            owner: IdentityId::from_bytes([2; 32]),
        }
    }

    fn record(state: u16) -> InstanceRecord {
        InstanceRecord {
            state_id: StateId(state),
            state_bytes: Vec::new(),
            buffered: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_then_load_then_commit() {
        let store = MemoryInstanceStore::new();
        assert!(store.load_for_update(&key()).await.unwrap().is_none());

        store.create(&key(), record(0)).await.unwrap();
        assert_eq!(
            store.load_for_update(&key()).await.unwrap().unwrap().state_id,
            StateId(0)
        );

        store.commit(&key(), record(1)).await.unwrap();
        assert_eq!(
            store.load_for_update(&key()).await.unwrap().unwrap().state_id,
            StateId(1)
        );
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = MemoryInstanceStore::new();
        store.create(&key(), record(0)).await.unwrap();
        assert!(store.create(&key(), record(0)).await.is_err());
    }

    #[tokio::test]
    async fn commit_requires_existing_record() {
        let store = MemoryInstanceStore::new();
        assert!(store.commit(&key(), record(1)).await.is_err());
    }

    #[tokio::test]
    async fn erase_is_idempotent() {
        let store = MemoryInstanceStore::new();
        store.create(&key(), record(0)).await.unwrap();
        store.erase(&key()).await.unwrap();
        store.erase(&key()).await.unwrap();
        assert!(store.is_empty().await);
    }
}
