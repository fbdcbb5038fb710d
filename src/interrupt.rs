//! Cooperative interruption of blocked lock waits.
//!
//! Threads in Rust carry no ambient interrupt status, so interruption is
//! an explicit handle: the waiting thread passes an [`InterruptHandle`]
//! into an interruptible lock operation, and any other thread can call
//! [`InterruptHandle::interrupt`] to set the flag and wake the wait.
//!
//! The flag semantics mirror the usual interrupt-status contract: an
//! interruptible operation that aborts its wait consumes the flag, while
//! an operation that resolves despite a pending interrupt returns normally
//! and leaves the flag set for the caller to observe.

use crate::client::ClientLock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A cooperative interrupt flag that can wake blocked lock waits.
///
/// Cheaply cloneable; clones share the same flag.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    inner: Arc<InterruptInner>,
}

#[derive(Default)]
struct InterruptInner {
    flag: AtomicBool,
    waiters: Mutex<Vec<Weak<ClientLock>>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake any lock wait registered with this handle.
    pub fn interrupt(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let waiters: Vec<Arc<ClientLock>> = {
            let registered = self.inner.waiters.lock();
            registered.iter().filter_map(Weak::upgrade).collect()
        };
        for lock in waiters {
            lock.wake_waiters();
        }
    }

    /// Check the flag without consuming it.
    pub fn is_interrupted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Consume the flag, reporting whether it was set.
    pub fn clear(&self) -> bool {
        self.inner.flag.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take(&self) -> bool {
        self.clear()
    }

    pub(crate) fn restore(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
    }

    /// Attach a waiting client lock for the duration of its wait.
    pub(crate) fn register(&self, lock: Weak<ClientLock>) -> InterruptRegistration {
        self.inner.waiters.lock().push(lock.clone());
        InterruptRegistration {
            inner: Arc::clone(&self.inner),
            lock,
        }
    }
}

/// Scoped registration of a waiting lock; detaches on drop.
pub(crate) struct InterruptRegistration {
    inner: Arc<InterruptInner>,
    lock: Weak<ClientLock>,
}

impl Drop for InterruptRegistration {
    fn drop(&mut self) {
        let mut waiters = self.inner.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| w.ptr_eq(&self.lock)) {
            waiters.swap_remove(pos);
        }
    }
}
