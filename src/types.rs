//! Core identity types for the meshlock protocol.
//!
//! # Key Types
//!
//! - [`MemberAddr`]: opaque identifier for a group member
//! - [`Owner`]: a specific thread on a specific member, the unit of lock
//!   ownership
//! - [`View`]: the current group membership, delivered by the transport
//!
//! Two threads of the same process contend for a lock exactly like threads
//! on different members do; the thread component of [`Owner`] is a stable
//! process-unique identifier assigned on a thread's first lock operation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier for a group member.
///
/// Equality and hashing are structural. Destinations in the transport use
/// `Option<MemberAddr>`, where `None` addresses every member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberAddr(u64);

impl MemberAddr {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for MemberAddr {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for MemberAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Identifies a lock holder or contender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    /// Member the owning thread runs on.
    pub addr: MemberAddr,
    /// Process-unique identifier of the owning thread.
    pub thread_id: u64,
}

impl Owner {
    pub fn new(addr: MemberAddr, thread_id: u64) -> Self {
        Self { addr, thread_id }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.addr, self.thread_id)
    }
}

/// Group membership as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Monotonically increasing view sequence number.
    pub id: u64,
    /// Members of this view, in coordinator order.
    pub members: Vec<MemberAddr>,
}

impl View {
    pub fn new(id: u64, members: Vec<MemberAddr>) -> Self {
        Self { id, members }
    }

    pub fn contains(&self, addr: MemberAddr) -> bool {
        self.members.contains(&addr)
    }

    /// The first member of the view, by convention the coordinator.
    pub fn coordinator(&self) -> Option<MemberAddr> {
        self.members.first().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|", self.id)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", m)?;
        }
        write!(f, "]")
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Stable identifier of the calling thread, unique within the process.
///
/// Assigned on first use and constant for the thread's lifetime. Ids are
/// never reused; stale registry entries cannot arise because every unlock
/// removes its client-lock entry deterministically.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_stable() {
        let a = current_thread_id();
        let b = current_thread_id();
        assert_eq!(a, b);
    }

    #[test]
    fn test_thread_id_unique_across_threads() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_owner_equality() {
        let a = Owner::new(MemberAddr::new(1), 7);
        let b = Owner::new(MemberAddr::new(1), 7);
        let c = Owner::new(MemberAddr::new(1), 8);
        let d = Owner::new(MemberAddr::new(2), 7);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_view_membership() {
        let view = View::new(3, vec![MemberAddr::new(1), MemberAddr::new(2)]);
        assert!(view.contains(MemberAddr::new(1)));
        assert!(!view.contains(MemberAddr::new(9)));
        assert_eq!(view.coordinator(), Some(MemberAddr::new(1)));
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn test_display_forms() {
        let owner = Owner::new(MemberAddr::new(4), 11);
        assert_eq!(owner.to_string(), "m4::11");
        let view = View::new(1, vec![MemberAddr::new(4)]);
        assert_eq!(view.to_string(), "[1|m4]");
    }
}
