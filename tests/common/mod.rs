//! In-memory group simulation for integration tests.
//!
//! Builds a group of members, each running its own `LockingProtocol` over
//! a shared router. Every member gets a dedicated delivery thread feeding
//! its up-path, so lock waits block and resolve exactly as they would over
//! a real transport: per sender-destination FIFO, asynchronous delivery.

use meshlock::{
    LockNotification, LockPlacement, LockService, LockingConfig, LockingProtocol, MemberAddr,
    MeshLockError, Owner, Result, Transport, TransportEvent, View,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// How long assertions wait for cross-thread effects to settle.
pub const SETTLE: Duration = Duration::from_millis(300);

type Inbox = mpsc::Sender<(Option<MemberAddr>, Vec<u8>)>;

#[derive(Default)]
struct Router {
    inboxes: Mutex<HashMap<MemberAddr, Inbox>>,
}

impl Router {
    fn register(&self, addr: MemberAddr, inbox: Inbox) {
        self.inboxes.lock().insert(addr, inbox);
    }
}

struct NodeTransport {
    addr: MemberAddr,
    router: Arc<Router>,
}

impl Transport for NodeTransport {
    fn send(&self, dest: Option<MemberAddr>, payload: &[u8], _bypass_bundling: bool) -> Result<()> {
        let inboxes = self.router.inboxes.lock();
        match dest {
            Some(dest) => {
                let inbox = inboxes
                    .get(&dest)
                    .ok_or_else(|| MeshLockError::SendFailed(format!("no route to {}", dest)))?;
                inbox
                    .send((Some(self.addr), payload.to_vec()))
                    .map_err(|_| MeshLockError::SendFailed(format!("{} is shut down", dest)))
            }
            None => {
                for inbox in inboxes.values() {
                    let _ = inbox.send((Some(self.addr), payload.to_vec()));
                }
                Ok(())
            }
        }
    }
}

/// One simulated group member.
pub struct TestNode {
    pub addr: MemberAddr,
    pub protocol: Arc<LockingProtocol>,
    pub service: LockService,
}

/// A simulated group of members sharing an in-memory router.
pub struct TestGroup {
    pub nodes: Vec<TestNode>,
    router: Arc<Router>,
    next_view_id: AtomicU64,
}

impl TestGroup {
    /// Build a group of `size` members with addresses 1..=size, install
    /// the initial view everywhere and start delivery threads.
    pub fn new(size: u64, placement: impl Fn() -> Arc<dyn LockPlacement>) -> Self {
        // show protocol traces when a run fails (respects RUST_LOG)
        let _ = tracing_subscriber::fmt::try_init();

        let router = Arc::new(Router::default());
        let mut nodes = Vec::new();

        for raw in 1..=size {
            let addr = MemberAddr::new(raw);
            let transport = Arc::new(NodeTransport {
                addr,
                router: Arc::clone(&router),
            });
            let protocol =
                LockingProtocol::new(LockingConfig::default(), transport, placement());
            protocol.up(TransportEvent::LocalAddress(addr));

            let (inbox, delivery) = mpsc::channel::<(Option<MemberAddr>, Vec<u8>)>();
            router.register(addr, inbox);
            {
                let protocol = Arc::clone(&protocol);
                thread::spawn(move || {
                    for (sender, payload) in delivery {
                        protocol.up(TransportEvent::Message { sender, payload });
                    }
                });
            }

            nodes.push(TestNode {
                addr,
                protocol: Arc::clone(&protocol),
                service: LockService::new(protocol),
            });
        }

        let group = Self {
            nodes,
            router,
            next_view_id: AtomicU64::new(1),
        };
        let all: Vec<MemberAddr> = group.nodes.iter().map(|n| n.addr).collect();
        group.install_view(&all);
        group
    }

    pub fn node(&self, raw: u64) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.addr == MemberAddr::new(raw))
            .expect("no such node")
    }

    /// Install a new view on every member still in it.
    pub fn install_view(&self, members: &[MemberAddr]) {
        let id = self.next_view_id.fetch_add(1, Ordering::Relaxed);
        let view = View::new(id, members.to_vec());
        for node in &self.nodes {
            if view.contains(node.addr) {
                node.protocol
                    .up(TransportEvent::ViewChange(view.clone()));
            }
        }
    }

    /// Remove a member from the group: cut its routing and install the
    /// shrunken view on the survivors.
    pub fn drop_member(&self, raw: u64) {
        let addr = MemberAddr::new(raw);
        self.router.inboxes.lock().remove(&addr);
        let survivors: Vec<MemberAddr> = self
            .nodes
            .iter()
            .map(|n| n.addr)
            .filter(|a| *a != addr)
            .collect();
        self.install_view(&survivors);
    }
}

/// Listener that records every notification as a flat string.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl LockNotification for RecordingListener {
    fn lock_created(&self, name: &str) {
        self.events.lock().push(format!("created:{}", name));
    }
    fn lock_deleted(&self, name: &str) {
        self.events.lock().push(format!("deleted:{}", name));
    }
    fn locked(&self, name: &str, owner: &Owner) {
        self.events.lock().push(format!("locked:{}:{}", name, owner));
    }
    fn unlocked(&self, name: &str, owner: &Owner) {
        self.events.lock().push(format!("unlocked:{}:{}", name, owner));
    }
}

impl RecordingListener {
    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.contains(needle))
            .count()
    }
}
