//! Application-facing lock service.
//!
//! [`LockService`] is a thin handle factory over a running
//! [`LockingProtocol`]: ask it for a named lock and get a [`LockHandle`]
//! exposing the blocking mutex contract. Handles are cheap and
//! thread-agnostic; ownership is per calling thread, so two threads using
//! handles for the same name contend like threads on different members,
//! and a thread re-locking a name it already holds is re-granted
//! immediately.

use crate::client::ClientLock;
use crate::error::Result;
use crate::interrupt::InterruptHandle;
use crate::notify::LockNotification;
use crate::protocol::LockingProtocol;
use std::sync::Arc;
use std::time::Duration;

/// Handle factory for named distributed locks.
#[derive(Clone)]
pub struct LockService {
    protocol: Arc<LockingProtocol>,
}

impl LockService {
    pub fn new(protocol: Arc<LockingProtocol>) -> Self {
        Self { protocol }
    }

    /// Get a handle for the named lock.
    pub fn lock(&self, name: &str) -> LockHandle {
        LockHandle {
            name: name.to_string(),
            protocol: Arc::clone(&self.protocol),
        }
    }

    /// Subscribe to lock lifecycle notifications.
    pub fn add_listener(&self, listener: Arc<dyn LockNotification>) {
        self.protocol.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LockNotification>) {
        self.protocol.remove_listener(listener);
    }

    /// Release every lock held or requested through this member.
    pub fn unlock_all(&self) {
        self.protocol.unlock_all();
    }
}

/// A named distributed lock bound to the calling thread's identity.
pub struct LockHandle {
    name: String,
    protocol: Arc<LockingProtocol>,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire, blocking until granted. Not interruptible.
    pub fn lock(&self) {
        self.client_lock().lock(&self.protocol);
    }

    /// Acquire, blocking until granted or `interrupt` fires.
    ///
    /// An interrupt before the grant retracts the request and returns
    /// [`MeshLockError::Interrupted`](crate::MeshLockError::Interrupted)
    /// with the flag consumed. An interrupt that loses the race against
    /// the grant is absorbed: the call returns `Ok` holding the lock and
    /// the flag stays set.
    pub fn lock_interruptibly(&self, interrupt: &InterruptHandle) -> Result<()> {
        self.client_lock().lock_interruptibly(&self.protocol, interrupt)
    }

    /// Try to acquire without waiting for contention to clear.
    ///
    /// Costs one round trip to the arbitrating member; a contended lock
    /// answers with an immediate denial.
    pub fn try_lock(&self) -> bool {
        self.client_lock().try_lock(&self.protocol)
    }

    /// Try to acquire, waiting at most `timeout`.
    ///
    /// On expiry the queued request is withdrawn and the call returns
    /// `Ok(false)`. Interrupt semantics match
    /// [`lock_interruptibly`](Self::lock_interruptibly).
    pub fn try_lock_for(&self, timeout: Duration, interrupt: &InterruptHandle) -> Result<bool> {
        self.client_lock()
            .try_lock_for(&self.protocol, timeout, interrupt)
    }

    /// Release the lock, or withdraw the calling thread's pending request.
    ///
    /// A no-op when the calling thread holds nothing under this name.
    pub fn unlock(&self) {
        let owner = self.protocol.local_owner();
        if let Some(lock) = self.protocol.find_client_lock(&self.name, &owner) {
            lock.unlock(&self.protocol);
        }
    }

    /// Whether the calling thread currently holds this lock.
    pub fn is_held(&self) -> bool {
        let owner = self.protocol.local_owner();
        self.protocol
            .find_client_lock(&self.name, &owner)
            .map(|lock| lock.is_held())
            .unwrap_or(false)
    }

    fn client_lock(&self) -> Arc<ClientLock> {
        let owner = self.protocol.local_owner();
        self.protocol.get_or_create_client_lock(&self.name, &owner)
    }
}
