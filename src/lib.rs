//! meshlock - distributed advisory locking for group-communication stacks.
//!
//! Members of a group cooperate to serialize access to named exclusive
//! locks: at most one thread on one member holds a given name at a time,
//! and contenders queue in arrival order on the member arbitrating that
//! name. The crate is a protocol layer, not a transport: it sits between
//! an application-facing lock API and whatever moves bytes and membership
//! views for the group.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │  LockService / LockHandle  (blocking mutex contract)  │
//! ├───────────────────────────────────────────────────────┤
//! │  LockingProtocol                                      │
//! │    client locks: per-(name, owner) blocking handles   │
//! │    server locks: per-name owner + FIFO waiter queue   │
//! │    placement:    which member arbitrates which name   │
//! ├───────────────────────────────────────────────────────┤
//! │  Transport (send sink)  /  TransportEvent (up-path)   │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! Lock state is in-memory only. A member restart loses its state; the
//! group reconstructs it from live traffic and view changes. Members that
//! leave the view release their locks and queue slots implicitly.
//!
//! # Quick start
//!
//! ```no_run
//! use meshlock::{
//!     CoordinatorPlacement, LockingConfig, LockingProtocol, LockService,
//!     MemberAddr, TransportEvent, View,
//! };
//! use std::sync::Arc;
//!
//! # fn transport() -> Arc<dyn meshlock::Transport> { unimplemented!() }
//! let protocol = LockingProtocol::new(
//!     LockingConfig::default(),
//!     transport(),
//!     Arc::new(CoordinatorPlacement::new()),
//! );
//! protocol.up(TransportEvent::LocalAddress(MemberAddr::new(2)));
//! protocol.up(TransportEvent::ViewChange(View::new(
//!     1,
//!     vec![MemberAddr::new(1), MemberAddr::new(2)],
//! )));
//!
//! let service = LockService::new(protocol);
//! let lock = service.lock("orders");
//! lock.lock();
//! // critical section
//! lock.unlock();
//! ```

pub mod config;
pub mod error;
pub mod types;

mod client;
pub mod interrupt;
pub mod notify;
pub mod placement;
pub mod protocol;
mod server;
pub mod service;
pub mod transport;
pub mod wire;

// Re-exports
pub use config::LockingConfig;
pub use error::{MeshLockError, Result};
pub use interrupt::InterruptHandle;
pub use notify::LockNotification;
pub use placement::{CoordinatorPlacement, HashedPlacement, LockPlacement};
pub use protocol::{LockingProtocol, LockingStats};
pub use service::{LockHandle, LockService};
pub use transport::{Transport, TransportEvent};
pub use types::{current_thread_id, MemberAddr, Owner, View};
pub use wire::{Request, RequestType};
