//! In-memory collaborator doubles for tests.
//!
//! Shared by this crate's tests and by concrete protocol crates, so
//! the doubles live in the library rather than under `tests/`. Each
//! double records the calls it receives and supports injecting
//! transient unavailability to exercise recoverable-failure paths.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::channel::ResolvedChannel;
use crate::message::MessageEnvelope;
use crate::ports::{
    ChannelTransport, DeliveryHandle, IdentityStore, Notification, NotificationSink, PortError,
    PortResult, ProviderBinding,
};
use crate::types::{DeviceId, IdentityId};

/// In-memory [`IdentityStore`] that records every mutation.
#[derive(Default)]
pub struct MockIdentityStore {
    devices: Mutex<HashMap<IdentityId, BTreeSet<DeviceId>>>,
    bindings: Mutex<HashMap<IdentityId, (String, ProviderBinding)>>,
    bind_log: Mutex<Vec<(IdentityId, String)>>,
    unbind_log: Mutex<Vec<IdentityId>>,
    unavailable: AtomicBool,
}

impl MockIdentityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one device under an identity.
    pub async fn register_device(&self, identity: IdentityId, device: DeviceId) {
        self.devices
            .lock()
            .await
            .entry(identity)
            .or_default()
            .insert(device);
    }

    /// When set, every call fails with [`PortError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The current binding for `owner`, if any.
    pub async fn binding_for(&self, owner: IdentityId) -> Option<(String, ProviderBinding)> {
        self.bindings.lock().await.get(&owner).cloned()
    }

    /// Every `bind_identity` call received, in order.
    pub async fn bind_log(&self) -> Vec<(IdentityId, String)> {
        self.bind_log.lock().await.clone()
    }

    /// Every `unbind_identity` call received, in order.
    pub async fn unbind_log(&self) -> Vec<IdentityId> {
        self.unbind_log.lock().await.clone()
    }

    fn check_available(&self) -> PortResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(PortError::Unavailable("identity store".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IdentityStore for MockIdentityStore {
    async fn bind_identity(
        &self,
        owner: IdentityId,
        external_user_id: &str,
        binding: ProviderBinding,
    ) -> PortResult<()> {
        self.check_available()?;
        self.bind_log
            .lock()
            .await
            .push((owner, external_user_id.to_owned()));
        self.bindings
            .lock()
            .await
            .insert(owner, (external_user_id.to_owned(), binding));
        Ok(())
    }

    async fn unbind_identity(&self, owner: IdentityId) -> PortResult<()> {
        self.check_available()?;
        self.unbind_log.lock().await.push(owner);
        self.bindings.lock().await.remove(&owner);
        Ok(())
    }

    async fn list_other_device_ids(&self, owner: IdentityId) -> PortResult<BTreeSet<DeviceId>> {
        self.check_available()?;
        Ok(self
            .devices
            .lock()
            .await
            .get(&owner)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_device_ids(&self, identity: IdentityId) -> PortResult<BTreeSet<DeviceId>> {
        self.check_available()?;
        Ok(self
            .devices
            .lock()
            .await
            .get(&identity)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory [`ChannelTransport`] that records every accepted send.
#[derive(Default)]
pub struct RecordingTransport {
    confirmed: Mutex<BTreeSet<(IdentityId, IdentityId, DeviceId)>>,
    sent: Mutex<Vec<(MessageEnvelope, ResolvedChannel)>>,
    next_handle: AtomicU64,
    unavailable: AtomicBool,
}

impl RecordingTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the channel between `owner`'s current device and the given
    /// remote device as confirmed.
    pub async fn confirm_channel(&self, owner: IdentityId, remote: IdentityId, device: DeviceId) {
        self.confirmed.lock().await.insert((owner, remote, device));
    }

    /// When set, every call fails with [`PortError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every send accepted so far, in order.
    pub async fn sent(&self) -> Vec<(MessageEnvelope, ResolvedChannel)> {
        self.sent.lock().await.clone()
    }

    /// Drain the recorded sends, returning them in order.
    pub async fn take_sent(&self) -> Vec<(MessageEnvelope, ResolvedChannel)> {
        std::mem::take(&mut *self.sent.lock().await)
    }

    fn check_available(&self) -> PortResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(PortError::Unavailable("transport".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChannelTransport for RecordingTransport {
    async fn send(
        &self,
        envelope: MessageEnvelope,
        channel: ResolvedChannel,
    ) -> PortResult<DeliveryHandle> {
        self.check_available()?;
        self.sent.lock().await.push((envelope, channel));
        Ok(DeliveryHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    async fn has_confirmed_channel(
        &self,
        owner: IdentityId,
        remote_identity: IdentityId,
        remote_device: DeviceId,
    ) -> PortResult<bool> {
        self.check_available()?;
        Ok(self
            .confirmed
            .lock()
            .await
            .contains(&(owner, remote_identity, remote_device)))
    }
}

/// In-memory [`NotificationSink`] that records every posted event.
#[derive(Default)]
pub struct RecordingNotifications {
    posted: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifications {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every post fails. The engine must swallow these.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every notification posted so far, in order.
    pub async fn posted(&self) -> Vec<Notification> {
        self.posted.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifications {
    async fn post(&self, notification: Notification) -> PortResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PortError::Unavailable("notification sink".to_owned()));
        }
        self.posted.lock().await.push(notification);
        Ok(())
    }
}
