//! Routing policy: which member arbitrates which lock.
//!
//! The protocol core never decides where server state lives. A
//! [`LockPlacement`] implementation maps lock names onto members of the
//! current view and, optionally, names backup members that mirror server
//! lock creation and deletion. Two stock policies cover the common
//! shapes; anything else (rack awareness, sticky assignment, external
//! coordination) plugs in through the same trait.

use crate::types::{MemberAddr, View};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Decides where the server replicas for a lock name live.
pub trait LockPlacement: Send + Sync {
    /// The member arbitrating `lock_name` in `view`, or `None` when no
    /// member can (an empty view). Requests without a server are dropped.
    fn locate_server(&self, lock_name: &str, view: &View) -> Option<MemberAddr>;

    /// Members that mirror server-lock create/delete so a failover
    /// replica can reconstruct ownership. Empty disables replication.
    fn backup_members(&self, _view: &View) -> Vec<MemberAddr> {
        Vec::new()
    }
}

/// Every lock is arbitrated by the view's coordinator (its first member).
///
/// With `replicate_to_backups` set, creations and deletions are mirrored
/// to all other members, so whichever member becomes coordinator after a
/// failure already holds the ownership state.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorPlacement {
    replicate_to_backups: bool,
}

impl CoordinatorPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backups(mut self, replicate: bool) -> Self {
        self.replicate_to_backups = replicate;
        self
    }
}

impl LockPlacement for CoordinatorPlacement {
    fn locate_server(&self, _lock_name: &str, view: &View) -> Option<MemberAddr> {
        view.coordinator()
    }

    fn backup_members(&self, view: &View) -> Vec<MemberAddr> {
        if !self.replicate_to_backups {
            return Vec::new();
        }
        view.members.iter().skip(1).copied().collect()
    }
}

/// Each lock name hashes onto one member of the view; no replication.
///
/// Every member must run the same build so the hash agrees across the
/// group. Server state for a name moves (and is lost) when the view
/// changes size; clients re-request against the new placement.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashedPlacement;

impl HashedPlacement {
    pub fn new() -> Self {
        Self
    }
}

impl LockPlacement for HashedPlacement {
    fn locate_server(&self, lock_name: &str, view: &View) -> Option<MemberAddr> {
        if view.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        lock_name.hash(&mut hasher);
        let index = (hasher.finish() % view.len() as u64) as usize;
        view.members.get(index).copied()
    }
}
