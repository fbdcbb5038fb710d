//! Listener callbacks for lock lifecycle events.

use crate::types::Owner;

/// Callbacks fired by the locking layer as lock state changes.
///
/// All methods default to no-ops so implementations can pick the events
/// they care about. Callbacks may run on transport delivery threads while
/// internal locks are held; a listener must not call back into the lock
/// API and wait for the result on the same thread.
pub trait LockNotification: Send + Sync {
    /// Server state for `name` was created on this member.
    fn lock_created(&self, _name: &str) {}

    /// The local client handle for `name` was released and discarded.
    fn lock_deleted(&self, _name: &str) {}

    /// `owner` acquired `name` on this member's server replica.
    fn locked(&self, _name: &str, _owner: &Owner) {}

    /// `owner` gave up `name` on this member's server replica, voluntarily
    /// or by leaving the view.
    fn unlocked(&self, _name: &str, _owner: &Owner) {}
}
