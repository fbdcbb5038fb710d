//! Server-side arbitration state for a single lock name.
//!
//! One [`ServerLock`] exists per lock name on the member arbitrating that
//! name. It tracks the current owner and a FIFO queue of pending grant
//! requests, and it is driven entirely by incoming [`Request`]s and view
//! changes. All operations on one lock are serialized by its mutex; the
//! dispatch is non-blocking and short-running.
//!
//! Grants remember the generation of the request they answered, and a
//! release only takes effect against a matching generation. A release
//! sent for an abandoned attempt can therefore never unlock a grant the
//! same owner obtained later, or withdraw its newer queued request.

use crate::protocol::LockingProtocol;
use crate::types::{MemberAddr, Owner};
use crate::wire::{Request, RequestType};
use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, error};

/// Arbitration state machine for one lock name.
pub(crate) struct ServerLock {
    name: String,
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    current_owner: Option<Owner>,
    /// Generation of the request the current grant answered; `0` when free.
    current_generation: u64,
    /// Pending grant requests in arrival order, excluding the holder's.
    /// Holds only `GrantLock` entries: releases are resolved on arrival.
    queue: Vec<Request>,
}

impl ServerLock {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Install replicated state with the owner already set.
    pub(crate) fn with_owner(name: impl Into<String>, owner: Owner, generation: u64) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ServerState {
                current_owner: Some(owner),
                current_generation: generation,
                queue: Vec::new(),
            }),
        }
    }

    /// Dispatch one grant or release request.
    pub(crate) fn handle_request(&self, req: Request, proto: &LockingProtocol) {
        let mut st = self.state.lock();
        match req.rtype {
            RequestType::GrantLock => match &st.current_owner {
                None => {
                    self.grant_to(&mut st, &req, proto);
                }
                Some(current) if *current == req.owner => {
                    // retried request from the holder, re-grant
                    st.current_generation = req.generation;
                    proto.send_lock_response(
                        RequestType::LockGranted,
                        &req.owner,
                        &self.name,
                        req.generation,
                    );
                }
                Some(_) if req.is_trylock && req.timeout_ms == 0 => {
                    proto.send_lock_response(
                        RequestType::LockDenied,
                        &req.owner,
                        &self.name,
                        req.generation,
                    );
                }
                Some(_) => Self::add_to_queue(&mut st, req),
            },
            RequestType::ReleaseLock => match &st.current_owner {
                // a release that beat the state into existence is dropped
                None => {}
                Some(current)
                    if *current == req.owner && st.current_generation == req.generation =>
                {
                    self.clear_owner(&mut st, proto);
                }
                Some(current) if *current == req.owner => {
                    // release for an attempt this grant did not answer
                    debug!(
                        lock = %self.name,
                        owner = %req.owner,
                        generation = req.generation,
                        "ignoring release for a superseded attempt"
                    );
                }
                Some(_) => Self::add_to_queue(&mut st, req),
            },
            other => {
                error!(lock = %self.name, rtype = %other, "request type not valid on a server lock");
            }
        }

        self.process_queue(&mut st, proto);
    }

    /// Drop state belonging to members that left the view.
    pub(crate) fn handle_view(&self, members: &[MemberAddr], proto: &LockingProtocol) {
        let mut st = self.state.lock();
        let mut evicted = 0u64;

        if let Some(current) = &st.current_owner {
            if !members.contains(&current.addr) {
                debug!(lock = %self.name, owner = %current, "unlocked because owner left the view");
                self.clear_owner(&mut st, proto);
                evicted += 1;
            }
        }

        let before = st.queue.len();
        st.queue.retain(|req| members.contains(&req.owner.addr));
        evicted += (before - st.queue.len()) as u64;

        if evicted > 0 {
            proto.record_evictions(evicted);
        }

        self.process_queue(&mut st, proto);
    }

    fn add_to_queue(st: &mut ServerState, req: Request) {
        if st.queue.is_empty() {
            if req.rtype == RequestType::GrantLock {
                st.queue.push(req);
            }
            // a release with nothing queued has nothing to withdraw
            return;
        }

        match req.rtype {
            RequestType::GrantLock => {
                // one queued request per owner; retries collapse into the first
                if !Self::request_present(&st.queue, RequestType::GrantLock, &req.owner) {
                    st.queue.push(req);
                }
            }
            RequestType::ReleaseLock => {
                // withdraw only the attempt the release names
                st.queue.retain(|r| {
                    !(r.rtype == RequestType::GrantLock
                        && r.owner == req.owner
                        && r.generation == req.generation)
                });
            }
            _ => {}
        }
    }

    fn request_present(queue: &[Request], rtype: RequestType, owner: &Owner) -> bool {
        queue.iter().any(|r| r.rtype == rtype && r.owner == *owner)
    }

    /// Promote the head of the queue while the lock is free.
    fn process_queue(&self, st: &mut ServerState, proto: &LockingProtocol) {
        if st.current_owner.is_some() {
            return;
        }
        while !st.queue.is_empty() {
            let req = st.queue.remove(0);
            if req.rtype == RequestType::GrantLock {
                self.grant_to(st, &req, proto);
                break;
            }
        }
    }

    fn grant_to(&self, st: &mut ServerState, req: &Request, proto: &LockingProtocol) {
        st.current_owner = Some(req.owner.clone());
        st.current_generation = req.generation;
        proto.notify_locked(&self.name, &req.owner);
        proto.send_lock_response(
            RequestType::LockGranted,
            &req.owner,
            &self.name,
            req.generation,
        );
    }

    fn clear_owner(&self, st: &mut ServerState, proto: &LockingProtocol) {
        if let Some(previous) = st.current_owner.take() {
            st.current_generation = 0;
            proto.notify_unlocked(&self.name, &previous);
        }
    }

    /// Whether this lock carries no state and can be discarded.
    pub(crate) fn is_free_and_empty(&self) -> bool {
        let st = self.state.lock();
        st.current_owner.is_none() && st.queue.is_empty()
    }

    pub(crate) fn current_owner(&self) -> Option<Owner> {
        self.state.lock().current_owner.clone()
    }

    /// Current owner together with the generation of its grant.
    pub(crate) fn current_grant(&self) -> Option<(Owner, u64)> {
        let st = self.state.lock();
        st.current_owner
            .clone()
            .map(|owner| (owner, st.current_generation))
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn queued_owners(&self) -> Vec<Owner> {
        self.state
            .lock()
            .queue
            .iter()
            .map(|r| r.owner.clone())
            .collect()
    }
}

impl fmt::Display for ServerLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        match &st.current_owner {
            Some(owner) => write!(f, "{}", owner)?,
            None => write!(f, "<free>")?,
        }
        if !st.queue.is_empty() {
            write!(f, ", queue: ")?;
            for req in &st.queue {
                write!(f, "{} ", req.short_form())?;
            }
        }
        Ok(())
    }
}
