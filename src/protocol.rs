//! The locking layer: registries, event dispatch and message plumbing.
//!
//! [`LockingProtocol`] sits between the lock API and the group transport.
//! API calls travel down: they resolve to a [`ClientLock`] handle and send
//! grant/release requests toward the member arbitrating the lock, chosen
//! by the [`LockPlacement`](crate::placement::LockPlacement) policy.
//! Incoming messages travel up: grant and release requests are dispatched
//! to the matching [`ServerLock`], grant and deny responses to the
//! matching [`ClientLock`], and create/delete replication installs or
//! drops server state wholesale. View changes prune owners and waiters
//! whose member left the group.
//!
//! Server state is created lazily on the first request naming an unknown
//! lock and discarded as soon as it is free with an empty queue; the check
//! runs after every request and after every view change, on the
//! replication path as much as on the demand path.

use crate::client::ClientLock;
use crate::config::LockingConfig;
use crate::notify::LockNotification;
use crate::placement::LockPlacement;
use crate::server::ServerLock;
use crate::transport::{Transport, TransportEvent};
use crate::types::{current_thread_id, MemberAddr, Owner, View};
use crate::wire::{self, Request, RequestType};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// The lock protocol layer for one group member.
pub struct LockingProtocol {
    config: LockingConfig,
    transport: Arc<dyn Transport>,
    placement: Arc<dyn LockPlacement>,
    local_addr: RwLock<Option<MemberAddr>>,
    view: RwLock<Option<View>>,
    server_locks: Mutex<HashMap<String, Arc<ServerLock>>>,
    client_locks: Mutex<HashMap<String, HashMap<Owner, Arc<ClientLock>>>>,
    listeners: Mutex<Vec<Arc<dyn LockNotification>>>,
    stats: StatsInner,
}

#[derive(Default)]
struct StatsInner {
    requests_sent: AtomicU64,
    responses_sent: AtomicU64,
    grants_received: AtomicU64,
    denials_received: AtomicU64,
    decode_failures: AtomicU64,
    send_failures: AtomicU64,
    view_evictions: AtomicU64,
    stale_grants_returned: AtomicU64,
}

/// Point-in-time counters for one [`LockingProtocol`].
#[derive(Debug, Clone, Default)]
pub struct LockingStats {
    /// Grant/release/replication requests sent.
    pub requests_sent: u64,
    /// Grant/deny responses sent by the server side.
    pub responses_sent: u64,
    /// Grant responses received by the client side.
    pub grants_received: u64,
    /// Deny responses received by the client side.
    pub denials_received: u64,
    /// Tagged messages that failed to decode and were dropped.
    pub decode_failures: u64,
    /// Outgoing messages rejected by the transport.
    pub send_failures: u64,
    /// Owners and waiters dropped by view changes.
    pub view_evictions: u64,
    /// Grants for abandoned attempts that were sent back as releases.
    pub stale_grants_returned: u64,
    /// Server locks currently hosted on this member.
    pub server_locks: usize,
    /// Client lock handles currently registered on this member.
    pub client_locks: usize,
}

impl LockingProtocol {
    pub fn new(
        config: LockingConfig,
        transport: Arc<dyn Transport>,
        placement: Arc<dyn LockPlacement>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            placement,
            local_addr: RwLock::new(None),
            view: RwLock::new(None),
            server_locks: Mutex::new(HashMap::new()),
            client_locks: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            stats: StatsInner::default(),
        })
    }

    // ------------------------------------------------------------------
    // Up-path
    // ------------------------------------------------------------------

    /// Feed one transport event into the layer.
    ///
    /// Returns `true` when the event was consumed (a message of this
    /// layer, decodable or not). View changes and address events are
    /// observed but reported unconsumed so the rest of the stack sees
    /// them too.
    pub fn up(&self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Message { sender, payload } => {
                if !wire::is_tagged(&payload, self.config.protocol_id) {
                    return false;
                }
                match Request::decode(&payload, self.config.protocol_id) {
                    Ok(req) => {
                        trace!(
                            "[{}] <-- [{}] {}",
                            self.local_addr_display(),
                            sender.map(|s| s.to_string()).unwrap_or_else(|| "?".into()),
                            req
                        );
                        self.dispatch(req);
                    }
                    Err(e) => {
                        self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "dropping undecodable lock message");
                    }
                }
                true
            }
            TransportEvent::ViewChange(view) => {
                self.handle_view(view);
                false
            }
            TransportEvent::LocalAddress(addr) => {
                self.set_local_address(addr);
                false
            }
        }
    }

    fn dispatch(&self, req: Request) {
        match req.rtype {
            RequestType::GrantLock | RequestType::ReleaseLock => self.handle_lock_request(req),
            RequestType::LockGranted => {
                self.stats.grants_received.fetch_add(1, Ordering::Relaxed);
                let matched = self
                    .find_client_lock(&req.lock_name, &req.owner)
                    .map_or(false, |lock| lock.lock_granted(req.generation));
                if !matched {
                    // a grant for an abandoned attempt goes straight back,
                    // otherwise the server would wait for an unlock forever
                    self.stats.stale_grants_returned.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        lock = %req.lock_name,
                        owner = %req.owner,
                        generation = req.generation,
                        "returning grant for an abandoned attempt"
                    );
                    self.send_release_lock(&req.lock_name, &req.owner, req.generation);
                }
            }
            RequestType::LockDenied => {
                self.stats.denials_received.fetch_add(1, Ordering::Relaxed);
                if let Some(lock) = self.find_client_lock(&req.lock_name, &req.owner) {
                    // a denial for an abandoned attempt carries no state to
                    // clean up and is dropped
                    let _ = lock.lock_denied(req.generation);
                }
            }
            RequestType::CreateLock => self.handle_create_lock(req),
            RequestType::DeleteLock => self.handle_delete_lock(req),
        }
    }

    fn handle_lock_request(&self, req: Request) {
        let name = req.lock_name.clone();
        let (lock, created) = {
            let mut locks = self.server_locks.lock();
            match locks.entry(name.clone()) {
                Entry::Occupied(e) => (Arc::clone(e.get()), false),
                Entry::Vacant(e) => {
                    let lock = Arc::new(ServerLock::new(name.clone()));
                    e.insert(Arc::clone(&lock));
                    (lock, true)
                }
            }
        };
        if created {
            self.notify_lock_created(&name);
        }

        lock.handle_request(req, self);

        if created {
            if let Some((owner, generation)) = lock.current_grant() {
                self.replicate_create(&name, &owner, generation);
            }
        }
        self.drop_server_lock_if_idle(&name);
    }

    /// Replication from an arbitrating peer: install state wholesale.
    fn handle_create_lock(&self, req: Request) {
        let lock = Arc::new(ServerLock::with_owner(
            req.lock_name.clone(),
            req.owner,
            req.generation,
        ));
        self.server_locks.lock().insert(req.lock_name, lock);
    }

    fn handle_delete_lock(&self, req: Request) {
        self.server_locks.lock().remove(&req.lock_name);
    }

    /// Install a new view, evicting departed owners and waiters.
    pub fn handle_view(&self, view: View) {
        debug!(view = %view, "installing view");
        *self.view.write() = Some(view.clone());

        let locks: Vec<Arc<ServerLock>> = self.server_locks.lock().values().cloned().collect();
        for lock in &locks {
            lock.handle_view(&view.members, self);
        }

        self.server_locks
            .lock()
            .retain(|_, lock| !lock.is_free_and_empty());
    }

    /// Record the local member's address. Must happen before the first
    /// lock operation; requests sent earlier carry a placeholder owner.
    pub fn set_local_address(&self, addr: MemberAddr) {
        *self.local_addr.write() = Some(addr);
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    fn drop_server_lock_if_idle(&self, name: &str) {
        let removed = {
            let mut locks = self.server_locks.lock();
            let idle = locks.get(name).map_or(false, |lock| lock.is_free_and_empty());
            if idle {
                locks.remove(name)
            } else {
                None
            }
        };
        if removed.is_some() {
            self.replicate_delete(name);
        }
    }

    pub(crate) fn get_or_create_client_lock(&self, name: &str, owner: &Owner) -> Arc<ClientLock> {
        let mut locks = self.client_locks.lock();
        let owners = locks.entry(name.to_string()).or_default();
        Arc::clone(
            owners
                .entry(owner.clone())
                .or_insert_with(|| ClientLock::new(name)),
        )
    }

    pub(crate) fn find_client_lock(&self, name: &str, owner: &Owner) -> Option<Arc<ClientLock>> {
        let locks = self.client_locks.lock();
        locks.get(name).and_then(|owners| owners.get(owner)).cloned()
    }

    pub(crate) fn remove_client_lock(&self, name: &str, owner: &Owner) {
        let mut locks = self.client_locks.lock();
        if let Some(owners) = locks.get_mut(name) {
            owners.remove(owner);
            if owners.is_empty() {
                locks.remove(name);
            }
        }
    }

    /// Release every lock held or requested through this member.
    pub fn unlock_all(&self) {
        // snapshot under the registry lock, release outside it
        let snapshot: Vec<Arc<ClientLock>> = {
            let locks = self.client_locks.lock();
            locks
                .values()
                .flat_map(|owners| owners.values().cloned())
                .collect()
        };
        for lock in snapshot {
            lock.unlock(self);
        }
    }

    /// The identity the calling thread uses for lock requests.
    pub(crate) fn local_owner(&self) -> Owner {
        let addr = self.local_addr.read().unwrap_or_else(|| {
            warn!("local address not set, using placeholder owner address");
            MemberAddr::new(0)
        });
        Owner::new(addr, current_thread_id())
    }

    pub(crate) fn local_address(&self) -> Option<MemberAddr> {
        *self.local_addr.read()
    }

    fn local_addr_display(&self) -> String {
        match *self.local_addr.read() {
            Some(addr) => addr.to_string(),
            None => "?".into(),
        }
    }

    // ------------------------------------------------------------------
    // Sends
    // ------------------------------------------------------------------

    pub(crate) fn send_grant_lock(
        &self,
        name: &str,
        owner: &Owner,
        timeout_ms: u64,
        is_trylock: bool,
        generation: u64,
    ) {
        let Some(dest) = self.locate_server(name) else {
            return;
        };
        self.send_request(
            Some(dest),
            Request::new(RequestType::GrantLock, name, owner.clone(), timeout_ms)
                .trylock(is_trylock)
                .generation(generation),
        );
    }

    pub(crate) fn send_release_lock(&self, name: &str, owner: &Owner, generation: u64) {
        let Some(dest) = self.locate_server(name) else {
            return;
        };
        self.send_request(
            Some(dest),
            Request::new(RequestType::ReleaseLock, name, owner.clone(), 0)
                .generation(generation),
        );
    }

    pub(crate) fn send_lock_response(
        &self,
        rtype: RequestType,
        dest: &Owner,
        name: &str,
        generation: u64,
    ) {
        let req = Request::new(rtype, name, dest.clone(), 0).generation(generation);
        let payload = match req.encode(self.config.protocol_id) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed encoding {} response", rtype);
                return;
            }
        };
        trace!("[{}] --> [{}] {}", self.local_addr_display(), dest.addr, req);
        match self
            .transport
            .send(Some(dest.addr), &payload, self.config.bypass_bundling)
        {
            Ok(()) => {
                self.stats.responses_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, dest = %dest, "failed sending {} response", rtype);
            }
        }
    }

    fn send_request(&self, dest: Option<MemberAddr>, req: Request) {
        let payload = match req.encode(self.config.protocol_id) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed encoding {} request", req.rtype);
                return;
            }
        };
        trace!(
            "[{}] --> [{}] {}",
            self.local_addr_display(),
            dest.map(|d| d.to_string()).unwrap_or_else(|| "ALL".into()),
            req
        );
        match self
            .transport
            .send(dest, &payload, self.config.bypass_bundling)
        {
            Ok(()) => {
                self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "failed sending {} request", req.rtype);
            }
        }
    }

    fn locate_server(&self, name: &str) -> Option<MemberAddr> {
        let view = self.view.read().clone();
        let Some(view) = view else {
            warn!(lock = %name, "no view installed, dropping request");
            return None;
        };
        let dest = self.placement.locate_server(name, &view);
        if dest.is_none() {
            warn!(lock = %name, view = %view, "placement found no server, dropping request");
        }
        dest
    }

    fn replicate_create(&self, name: &str, owner: &Owner, generation: u64) {
        for backup in self.backup_members() {
            self.send_request(
                Some(backup),
                Request::new(RequestType::CreateLock, name, owner.clone(), 0)
                    .generation(generation),
            );
        }
    }

    fn replicate_delete(&self, name: &str) {
        let backups = self.backup_members();
        if backups.is_empty() {
            return;
        }
        // the wire format always carries an owner; receivers ignore it here
        let owner = Owner::new(self.local_address().unwrap_or(MemberAddr::new(0)), 0);
        for backup in backups {
            self.send_request(
                Some(backup),
                Request::new(RequestType::DeleteLock, name, owner.clone(), 0),
            );
        }
    }

    fn backup_members(&self) -> Vec<MemberAddr> {
        let view = self.view.read().clone();
        match view {
            Some(view) => self.placement.backup_members(&view),
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn LockNotification>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LockNotification>) {
        self.listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn LockNotification>> {
        self.listeners.lock().clone()
    }

    fn notify_each(&self, what: &str, f: impl Fn(&dyn LockNotification)) {
        for listener in self.listeners_snapshot() {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                error!(event = %what, "lock listener panicked");
            }
        }
    }

    pub(crate) fn notify_lock_created(&self, name: &str) {
        self.notify_each("lock_created", |l| l.lock_created(name));
    }

    pub(crate) fn notify_lock_deleted(&self, name: &str) {
        self.notify_each("lock_deleted", |l| l.lock_deleted(name));
    }

    pub(crate) fn notify_locked(&self, name: &str, owner: &Owner) {
        self.notify_each("locked", |l| l.locked(name, owner));
    }

    pub(crate) fn notify_unlocked(&self, name: &str, owner: &Owner) {
        self.notify_each("unlocked", |l| l.unlocked(name, owner));
    }

    pub(crate) fn record_evictions(&self, count: u64) {
        self.stats.view_evictions.fetch_add(count, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn stats(&self) -> LockingStats {
        let server_locks = self.server_locks.lock().len();
        let client_locks = self
            .client_locks
            .lock()
            .values()
            .map(|owners| owners.len())
            .sum();
        LockingStats {
            requests_sent: self.stats.requests_sent.load(Ordering::Relaxed),
            responses_sent: self.stats.responses_sent.load(Ordering::Relaxed),
            grants_received: self.stats.grants_received.load(Ordering::Relaxed),
            denials_received: self.stats.denials_received.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
            view_evictions: self.stats.view_evictions.load(Ordering::Relaxed),
            stale_grants_returned: self.stats.stale_grants_returned.load(Ordering::Relaxed),
            server_locks,
            client_locks,
        }
    }

    /// Current owner of a hosted server lock, if any.
    pub fn server_lock_owner(&self, name: &str) -> Option<Owner> {
        self.server_locks
            .lock()
            .get(name)
            .and_then(|lock| lock.current_owner())
    }

    /// Number of queued waiters on a hosted server lock.
    pub fn server_queue_len(&self, name: &str) -> usize {
        self.server_locks
            .lock()
            .get(name)
            .map(|lock| lock.queue_len())
            .unwrap_or(0)
    }

    /// Queued waiters of a hosted server lock, in grant order.
    pub fn server_queued_owners(&self, name: &str) -> Vec<Owner> {
        self.server_locks
            .lock()
            .get(name)
            .map(|lock| lock.queued_owners())
            .unwrap_or_default()
    }

    /// Names of the server locks hosted on this member.
    pub fn server_lock_names(&self) -> Vec<String> {
        self.server_locks.lock().keys().cloned().collect()
    }

    /// Number of client lock handles registered on this member.
    pub fn client_lock_count(&self) -> usize {
        self.client_locks
            .lock()
            .values()
            .map(|owners| owners.len())
            .sum()
    }

    /// Render all server and client locks for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::from("server locks:\n");
        {
            let locks = self.server_locks.lock();
            for (name, lock) in locks.iter() {
                let _ = writeln!(out, "{}: {}", name, lock);
            }
        }

        out.push_str("\nmy locks: ");
        {
            let locks = self.client_locks.lock();
            let mut first = true;
            for (name, owners) in locks.iter() {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                let _ = write!(out, "{} (", name);
                let mut first_owner = true;
                for (owner, lock) in owners.iter() {
                    if !first_owner {
                        out.push_str(", ");
                    }
                    first_owner = false;
                    let _ = write!(out, "{}", owner);
                    if !lock.is_held() {
                        out.push_str(", unlocked");
                    }
                }
                out.push(')');
            }
        }
        out
    }
}
