//! Transport interface between the locking layer and the group stack.
//!
//! The layer does not know how messages move. It requires a send sink
//! ([`Transport`]) from the surrounding stack and feeds every incoming
//! event into [`LockingProtocol::up`](crate::LockingProtocol::up) as a
//! [`TransportEvent`]. Delivery, framing, flow control, view computation
//! and failure detection all live below this boundary.
//!
//! The transport is assumed FIFO per sender-destination pair. Duplicates
//! are tolerated: both sides of the protocol are idempotent.

use crate::error::Result;
use crate::types::{MemberAddr, View};

/// Send sink provided by the surrounding group-communication stack.
pub trait Transport: Send + Sync {
    /// Deliver `payload` to `dest`, or to every member when `dest` is `None`.
    ///
    /// `bypass_bundling` asks the transport not to batch this message with
    /// other traffic. It is a latency hint; correctness does not depend on
    /// it. A send failure is reported to the caller, logged there and the
    /// message is dropped; the protocol recovers through timeouts and
    /// retries by its callers.
    fn send(&self, dest: Option<MemberAddr>, payload: &[u8], bypass_bundling: bool) -> Result<()>;
}

/// Events delivered from the transport into the layer's up-path.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An opaque payload from another member (or looped back from this one).
    Message {
        /// Originating member, when the transport knows it.
        sender: Option<MemberAddr>,
        /// Raw payload bytes.
        payload: Vec<u8>,
    },
    /// A new membership view was installed.
    ViewChange(View),
    /// The local member's address, delivered once the stack knows it.
    LocalAddress(MemberAddr),
}
