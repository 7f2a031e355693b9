use crate::codec::{Codec, PassthroughCodec};
use std::sync::Arc;

/// Which `LoadBalancer` variant the server constructs. See `spec.md` §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbKind {
    RoundRobin,
    LeastConnections,
    SourceAddrHash,
}

impl Default for LbKind {
    fn default() -> Self {
        LbKind::RoundRobin
    }
}

/// Server configuration. Mirrors `spec.md` §3's `options` field set.
///
/// Construct with `Options::default()` and adjust fields, or use the
/// `with_*` builder methods for a fluent style.
#[derive(Clone)]
pub struct Options {
    /// Use the number of available CPUs as the event loop count. Overridden
    /// by `num_event_loop` when it is `> 0`.
    pub multicore: bool,
    /// Explicit event loop count. `0` means "let `multicore` decide".
    pub num_event_loop: usize,
    /// Bind every distributed-mode listener with `SO_REUSEPORT`.
    pub reuse_port: bool,
    /// Pin each loop's thread to a CPU core via `core_affinity`.
    pub lock_os_thread: bool,
    /// Run a periodic `OnTick` callback on the ticker host loop.
    pub ticker: bool,
    pub tcp_keepalive: bool,
    pub tcp_nodelay: bool,
    pub socket_recv_buffer: Option<usize>,
    pub socket_send_buffer: Option<usize>,
    /// Scratch read buffer capacity, reused across reads on one loop.
    pub read_buffer_cap: usize,
    pub codec: Arc<dyn Codec>,
    pub lb: LbKind,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            multicore: false,
            num_event_loop: 0,
            reuse_port: false,
            lock_os_thread: false,
            ticker: false,
            tcp_keepalive: false,
            tcp_nodelay: false,
            socket_recv_buffer: None,
            socket_send_buffer: None,
            read_buffer_cap: 64 * 1024,
            codec: Arc::new(PassthroughCodec),
            lb: LbKind::RoundRobin,
        }
    }
}

impl Options {
    /// Resolve the number of event loops per `spec.md` §4.1 step 1:
    /// default 1; `multicore` uses the CPU count; an explicit
    /// `num_event_loop > 0` always wins.
    pub fn resolve_num_event_loop(&self) -> usize {
        if self.num_event_loop > 0 {
            return self.num_event_loop;
        }
        if self.multicore {
            return num_cpus::get().max(1);
        }
        1
    }

    pub fn with_num_event_loop(mut self, n: usize) -> Self {
        self.num_event_loop = n;
        self
    }

    pub fn with_multicore(mut self, yes: bool) -> Self {
        self.multicore = yes;
        self
    }

    pub fn with_reuse_port(mut self, yes: bool) -> Self {
        self.reuse_port = yes;
        self
    }

    pub fn with_lock_os_thread(mut self, yes: bool) -> Self {
        self.lock_os_thread = yes;
        self
    }

    pub fn with_ticker(mut self, yes: bool) -> Self {
        self.ticker = yes;
        self
    }

    pub fn with_lb(mut self, lb: LbKind) -> Self {
        self.lb = lb;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_read_buffer_cap(mut self, cap: usize) -> Self {
        self.read_buffer_cap = cap;
        self
    }
}
