use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::event_loop::EventLoop;
use crate::listener::Network;
use crate::options::LbKind;
use crate::poller::PollerHandle;

/// A registered loop's external handle: everything the supervisor thread,
/// the main reactor, or an `add_tcp_connector` caller needs without ever
/// touching the loop's own thread-local state directly.
#[derive(Clone)]
pub struct LoopHandle {
    pub idx: i32,
    pub trigger: PollerHandle<EventLoop>,
    /// Updated by the owning loop on every insert/remove. Reads from
    /// other threads are intentionally non-atomic-ordering-strict —
    /// `spec.md` §4.3: "transient staleness is acceptable."
    pub conn_count: Arc<AtomicUsize>,
}

/// Selects a target loop for a new connection. A tagged variant rather
/// than a trait object, per `spec.md` design note §9 ("no virtual
/// hierarchy required").
pub struct LoadBalancer {
    kind: LbKind,
    loops: Vec<LoopHandle>,
    rr_counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(kind: LbKind) -> Self {
        LoadBalancer {
            kind,
            loops: Vec::new(),
            rr_counter: AtomicUsize::new(0),
        }
    }

    /// Assigns `idx = len(loops)` before appending, then registers.
    /// Called only during startup, on the supervisor thread.
    pub fn register(&mut self, mut handle: LoopHandle) -> i32 {
        let idx = self.loops.len() as i32;
        handle.idx = idx;
        self.loops.push(handle);
        idx
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn iterate(&self, mut f: impl FnMut(usize, &LoopHandle) -> bool) {
        for (i, l) in self.loops.iter().enumerate() {
            if !f(i, l) {
                break;
            }
        }
    }

    /// Selects the target loop for an incoming connection from
    /// `remote_addr`. `network` decides whether `source_addr_hash` keys
    /// on IP+port (TCP) or IP only (UDP), per `spec.md` §4.3.
    pub fn next(&self, remote_addr: SocketAddr, network: Network) -> &LoopHandle {
        assert!(!self.loops.is_empty(), "load balancer has no registered loops");
        match self.kind {
            LbKind::RoundRobin => {
                let i = self.rr_counter.fetch_add(1, Ordering::Relaxed) % self.loops.len();
                &self.loops[i]
            }
            LbKind::LeastConnections => {
                let mut best = &self.loops[0];
                let mut best_count = best.conn_count.load(Ordering::Relaxed);
                for l in &self.loops[1..] {
                    let c = l.conn_count.load(Ordering::Relaxed);
                    if c < best_count {
                        best = l;
                        best_count = c;
                    }
                }
                best
            }
            LbKind::SourceAddrHash => {
                let mut hasher = DefaultHasher::new();
                match network {
                    Network::Udp => remote_addr.ip().hash(&mut hasher),
                    Network::Tcp => remote_addr.hash(&mut hasher),
                }
                let i = (hasher.finish() as usize) % self.loops.len();
                &self.loops[i]
            }
        }
    }
}
