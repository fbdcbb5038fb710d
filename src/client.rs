//! Requester-side lock handle state.
//!
//! One [`ClientLock`] exists per `(lock name, owner)` pair on the member
//! doing the requesting. It turns the asynchronous grant/deny message flow
//! into the blocking mutex contract: callers park on a condition variable
//! until the server's answer arrives, a timeout expires or an interrupt
//! fires. Cancellation from either source always retracts the outstanding
//! request with a release message, so a racing grant is resolved by the
//! server either as an unlock or as a queue withdrawal.
//!
//! Every acquisition attempt carries a process-unique generation. The
//! server echoes it in responses, so a grant that arrives after its
//! attempt was abandoned cannot be mistaken for an answer to a later
//! attempt by the same thread; the layer sends it straight back as a
//! forced release instead.

use crate::error::{MeshLockError, Result};
use crate::interrupt::InterruptHandle;
use crate::protocol::LockingProtocol;
use crate::types::Owner;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Generation tag for one acquisition attempt. Never zero.
fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Client-side state for one `(lock name, owner)` pair.
pub(crate) struct ClientLock {
    name: String,
    state: Mutex<ClientState>,
    cond: Condvar,
    /// Self-reference handed to interrupt handles so they can wake us.
    me: Weak<ClientLock>,
}

#[derive(Default)]
struct ClientState {
    /// Set while a request is in flight or the lock is held.
    owner: Option<Owner>,
    acquired: bool,
    denied: bool,
    is_trylock: bool,
    timeout_ms: u64,
    /// Attempt tag of the outstanding or granted request; `0` before the
    /// first request.
    generation: u64,
}

impl ClientLock {
    pub(crate) fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            name,
            state: Mutex::new(ClientState::default()),
            cond: Condvar::new(),
            me: me.clone(),
        })
    }

    /// Blocking acquire. Not interruptible.
    pub(crate) fn lock(&self, proto: &LockingProtocol) {
        // cannot fail without an interrupt source
        let _ = self.acquire(proto, None, false);
    }

    /// Blocking acquire that gives up when `interrupt` fires first.
    ///
    /// An interrupt that loses the race against the grant is absorbed: the
    /// call returns `Ok` holding the lock and the flag stays set.
    pub(crate) fn lock_interruptibly(
        &self,
        proto: &LockingProtocol,
        interrupt: &InterruptHandle,
    ) -> Result<()> {
        self.acquire(proto, Some(interrupt), true)
    }

    /// Non-blocking try: one round trip, then the outcome.
    pub(crate) fn try_lock(&self, proto: &LockingProtocol) -> bool {
        self.acquire_try(proto, 0, false, None).unwrap_or(false)
    }

    /// Bounded try: waits up to `timeout` for the grant.
    pub(crate) fn try_lock_for(
        &self,
        proto: &LockingProtocol,
        timeout: Duration,
        interrupt: &InterruptHandle,
    ) -> Result<bool> {
        self.acquire_try(proto, timeout.as_millis() as u64, true, Some(interrupt))
    }

    pub(crate) fn unlock(&self, proto: &LockingProtocol) {
        let mut st = self.state.lock();
        self.unlock_locked(&mut st, proto, false);
    }

    /// Up-path: the server granted our request. Idempotent for the live
    /// attempt; returns `false` for a grant belonging to an abandoned one,
    /// which the caller must send back as a release.
    pub(crate) fn lock_granted(&self, generation: u64) -> bool {
        let mut st = self.state.lock();
        if st.owner.is_none() || generation != st.generation {
            return false;
        }
        st.acquired = true;
        self.cond.notify_all();
        true
    }

    /// Up-path: the server denied our non-blocking try. Idempotent; a
    /// denial for an abandoned attempt reports `false` and is dropped.
    pub(crate) fn lock_denied(&self, generation: u64) -> bool {
        let mut st = self.state.lock();
        if st.owner.is_none() || generation != st.generation {
            return false;
        }
        st.denied = true;
        self.cond.notify_all();
        true
    }

    /// Wake any thread parked on this lock so it can re-check its state.
    pub(crate) fn wake_waiters(&self) {
        let _st = self.state.lock();
        self.cond.notify_all();
    }

    pub(crate) fn is_held(&self) -> bool {
        let st = self.state.lock();
        st.acquired && !st.denied
    }

    fn acquire(
        &self,
        proto: &LockingProtocol,
        interrupt: Option<&InterruptHandle>,
        err_on_interrupt: bool,
    ) -> Result<()> {
        let _registration = interrupt.map(|h| h.register(self.me.clone()));
        let mut st = self.state.lock();
        if st.acquired {
            return Ok(());
        }

        let owner = proto.local_owner();
        st.owner = Some(owner.clone());
        st.is_trylock = false;
        st.timeout_ms = 0;
        st.generation = next_generation();
        proto.send_grant_lock(&self.name, &owner, 0, false, st.generation);

        let mut interrupted = false;
        while !st.acquired {
            // the state mutex is held between the check and the wait, and
            // interrupt() wakes under the same mutex, so no wakeup is lost
            if interrupt.map_or(false, |h| h.take()) {
                if err_on_interrupt {
                    self.unlock_locked(&mut st, proto, true);
                    return Err(MeshLockError::Interrupted);
                }
                interrupted = true;
            }
            self.cond.wait(&mut st);
        }

        if interrupted {
            if let Some(h) = interrupt {
                h.restore();
            }
        }
        Ok(())
    }

    fn acquire_try(
        &self,
        proto: &LockingProtocol,
        timeout_ms: u64,
        use_timeout: bool,
        interrupt: Option<&InterruptHandle>,
    ) -> Result<bool> {
        let _registration = interrupt.map(|h| h.register(self.me.clone()));
        let mut st = self.state.lock();
        if st.denied {
            return Ok(false);
        }

        if !st.acquired {
            st.is_trylock = true;
            st.timeout_ms = timeout_ms;
            st.generation = next_generation();
            let owner = proto.local_owner();
            st.owner = Some(owner.clone());
            proto.send_grant_lock(&self.name, &owner, timeout_ms, true, st.generation);

            let deadline = use_timeout.then(|| Instant::now() + Duration::from_millis(timeout_ms));
            while !st.acquired && !st.denied {
                if interrupt.map_or(false, |h| h.take()) {
                    self.unlock_locked(&mut st, proto, true);
                    return Err(MeshLockError::Interrupted);
                }
                match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        let remaining = deadline - now;
                        st.timeout_ms = remaining.as_millis() as u64;
                        let _ = self.cond.wait_for(&mut st, remaining);
                    }
                    None => self.cond.wait(&mut st),
                }
            }
        }

        let granted = st.acquired && !st.denied;
        if !granted {
            // withdraw the queued request; if a grant already raced past the
            // timeout, the forced release tells the server to give it back
            self.unlock_locked(&mut st, proto, true);
        }
        Ok(granted)
    }

    fn unlock_locked(&self, st: &mut ClientState, proto: &LockingProtocol, force: bool) {
        if !st.acquired && !st.denied && !force {
            return;
        }
        st.timeout_ms = 0;
        st.is_trylock = false;
        if let Some(owner) = st.owner.clone() {
            proto.send_release_lock(&self.name, &owner, st.generation);
        }
        st.acquired = false;
        st.denied = false;
        self.cond.notify_all();

        if let Some(owner) = st.owner.take() {
            proto.remove_client_lock(&self.name, &owner);
            proto.notify_lock_deleted(&self.name);
        }
    }
}
