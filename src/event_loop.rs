//! The single-threaded actor described in `spec.md` §2.3/§4.5: owns a
//! connection table, a scratch read buffer, and (optionally) a listener.
//! Everything here runs exclusively on the owning loop's thread — the only
//! cross-thread entry points are the `Task<EventLoop>` closures submitted
//! through the loop's `Poller`/`Reg` pair.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::codec::Codec;
use crate::conn::Conn;
use crate::handler::{Action, EventHandler};
use crate::listener::Listener;
use crate::load_balancer::LoadBalancer;
use crate::poller::{EventFlags, Flow, Poller, Reg};
use crate::server::Inner;

/// How an accepted connection gets installed. Distributed-mode loops own
/// their listener and install directly; the main reactor has no
/// `connections` table of its own and redistributes to a sub-reactor via
/// the load balancer (`spec.md` §4.6).
pub(crate) enum AcceptMode {
    Local,
    Redistribute { lb: Arc<LoadBalancer> },
}

/// A `HashMap<RawFd, Conn>` that keeps an `AtomicUsize` mirror of its
/// length in lockstep on every insert/remove. This is the single source
/// of truth `LoadBalancer::LeastConnections` reads from other threads
/// (`spec.md` §4.3) — by construction the count can never drift from the
/// table it mirrors, unlike scattered `store(self.connections.len())`
/// call sites would.
pub(crate) struct CountingMap {
    inner: HashMap<RawFd, Conn>,
    count: Arc<AtomicUsize>,
}

impl CountingMap {
    pub(crate) fn new(count: Arc<AtomicUsize>) -> Self {
        CountingMap {
            inner: HashMap::new(),
            count,
        }
    }

    pub(crate) fn insert(&mut self, fd: RawFd, conn: Conn) -> Option<Conn> {
        let prev = self.inner.insert(fd, conn);
        self.count.store(self.inner.len(), Ordering::Relaxed);
        prev
    }

    pub(crate) fn remove(&mut self, fd: &RawFd) -> Option<Conn> {
        let removed = self.inner.remove(fd);
        if removed.is_some() {
            self.count.store(self.inner.len(), Ordering::Relaxed);
        }
        removed
    }

    pub(crate) fn get(&self, fd: &RawFd) -> Option<&Conn> {
        self.inner.get(fd)
    }

    pub(crate) fn get_mut(&mut self, fd: &RawFd) -> Option<&mut Conn> {
        self.inner.get_mut(fd)
    }

    pub(crate) fn contains_key(&self, fd: &RawFd) -> bool {
        self.inner.contains_key(fd)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &RawFd> {
        self.inner.keys()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}

/// The per-loop context type. `idx == -1` identifies the main reactor
/// (`spec.md` §3 "Event loop").
pub struct EventLoop {
    pub(crate) idx: i32,
    pub(crate) reg: Reg,
    pub(crate) ln: Option<Arc<Listener>>,
    pub(crate) accept_mode: AcceptMode,
    pub(crate) connections: CountingMap,
    /// Shared with this loop's `LoopHandle` in the load balancer; kept
    /// in sync by `CountingMap` rather than by hand. Still consulted
    /// directly when a speculative pre-increment made before a trigger
    /// was submitted (`spec.md` §4.6/§4.7) needs correcting after the
    /// trigger's install fails.
    pub(crate) conn_count: Arc<AtomicUsize>,
    /// Scratch read buffer, sized to `options.read_buffer_cap` and reused
    /// across every read on this loop (`spec.md` §3 "Event loop" buffer
    /// field).
    pub(crate) read_buf: Vec<u8>,
    pub(crate) svr: Weak<Inner>,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive: bool,
}

impl EventLoop {
    fn in_shutdown(&self) -> bool {
        self.svr
            .upgrade()
            .map(|s| s.in_shutdown.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    fn signal_shutdown(&self) {
        if let Some(s) = self.svr.upgrade() {
            s.signal_shutdown();
        }
    }

    fn apply_action(&self, action: Action) {
        if action == Action::Shutdown {
            self.signal_shutdown();
        }
    }

    /// The readiness dispatch described in `spec.md` §4.5: a known fd is a
    /// connection (`SOCK_CLOSE`/`WRITE`/`READ`), anything else is a
    /// listener readiness.
    pub(crate) fn dispatch(&mut self, fd: RawFd, flags: EventFlags) -> io::Result<Flow> {
        if self.connections.contains_key(&fd) {
            if flags.closed {
                self.loop_close_conn(fd, None)?;
            } else {
                if flags.writable {
                    self.loop_write(fd)?;
                }
                if flags.readable && self.connections.contains_key(&fd) {
                    self.loop_read(fd)?;
                }
            }
            return Ok(Flow::Continue);
        }
        self.loop_accept(fd)
    }

    /// `spec.md` §4.6: drain the accept queue on listener readiness. UDP
    /// listeners never reach this path: their pseudo-connection is
    /// installed once, up front, during activation (see
    /// `crate::server::start_distributed`), so readiness on a UDP fd is
    /// always dispatched as ordinary connection traffic instead.
    fn loop_accept(&mut self, listener_fd: RawFd) -> io::Result<Flow> {
        let Some(ln) = self.ln.clone() else {
            log::warn!("readiness on unknown fd {listener_fd}, ignoring");
            return Ok(Flow::Continue);
        };
        if ln.fd() != listener_fd || ln.network().is_udp() {
            log::warn!("readiness on unknown fd {listener_fd}, ignoring");
            return Ok(Flow::Continue);
        }

        loop {
            let (stream, remote_addr) = match ln.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            };

            if self.in_shutdown() {
                // Open Question in spec.md §9: accepted-but-not-yet-dispatched
                // FDs must be closed, not leaked, once shutdown has begun.
                drop(stream);
                continue;
            }

            match &self.accept_mode {
                AcceptMode::Local => {
                    let fd = stream.as_raw_fd();
                    let conn = Conn::new_tcp(stream, remote_addr, self.idx);
                    if let Err(e) = self.install_local(fd, conn) {
                        log::warn!("failed to install accepted connection: {e}");
                    }
                }
                AcceptMode::Redistribute { lb } => {
                    let target = lb.next(remote_addr, ln.network()).clone();
                    target.conn_count.fetch_add(1, Ordering::Relaxed);
                    let idx = target.idx;
                    let dec = target.conn_count.clone();
                    let submitted = target.trigger.trigger(Box::new(move |el: &mut EventLoop| {
                        let fd = stream.as_raw_fd();
                        let conn = Conn::new_tcp(stream, remote_addr, idx);
                        // A failed install must drop only this connection,
                        // not the whole loop (`spec.md` §4.6: "close FD and
                        // release the conn") — never propagate the error as
                        // the task's own result.
                        match el.install_local(fd, conn) {
                            Ok(flow) => Ok(flow),
                            Err(e) => {
                                log::warn!(
                                    "failed to install redistributed connection on loop {idx}: {e}"
                                );
                                el.conn_count.fetch_sub(1, Ordering::Relaxed);
                                Ok(Flow::Continue)
                            }
                        }
                    }));
                    if let Err(e) = submitted {
                        log::warn!("failed to dispatch accepted connection to loop {idx}: {e}");
                        dec.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Installs `conn` into this loop's table, registers its fd, and runs
    /// `loopOpen`. Shared by the distributed accept path, the reactor
    /// redistribution trigger, and `add_tcp_connector`. `CountingMap`
    /// keeps `conn_count` current on insert; no manual bookkeeping here.
    pub(crate) fn install_local(&mut self, fd: RawFd, conn: Conn) -> io::Result<Flow> {
        if let Err(e) = self.reg.add_read_write(fd) {
            return Err(e);
        }
        if let Err(e) = conn.apply_tcp_options(self.tcp_nodelay, self.tcp_keepalive) {
            log::warn!("failed to apply socket options to fd {fd}: {e}");
        }
        self.connections.insert(fd, conn);
        self.loop_open(fd)
    }

    fn loop_open(&mut self, fd: RawFd) -> io::Result<Flow> {
        let codec = Arc::clone(&self.codec);
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(Flow::Continue);
        };
        let (out, action) = self.handler.on_opened(conn);
        if let Some(frame) = out {
            queue_encoded(conn, &*codec, frame);
        }
        let closing = conn.is_closing();
        self.apply_action(action);
        if action == Action::Close || closing {
            self.loop_close_conn(fd, None)?;
            return Ok(Flow::Continue);
        }
        self.loop_write(fd)?;
        Ok(Flow::Continue)
    }

    /// Per-connection read faults (ECONNRESET and friends) close only this
    /// connection via `loopCloseConn` and are reported through
    /// `OnClosed`; they must never escape as `?` here, or a single bad
    /// peer would tear down every other connection multiplexed on this
    /// loop (`spec.md` §7).
    fn loop_read(&mut self, fd: RawFd) -> io::Result<Flow> {
        let is_udp = self.connections.get(&fd).map(Conn::is_udp).unwrap_or(false);
        if is_udp {
            return self.loop_read_udp(fd);
        }

        let scratch = &mut self.read_buf;
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(Flow::Continue);
        };
        let closed = match conn.fill_read_accum(scratch) {
            Ok(closed) => closed,
            Err(e) => {
                self.loop_close_conn(fd, Some(e))?;
                return Ok(Flow::Continue);
            }
        };
        self.react_on_buffered_frames(fd)?;

        if self.connections.contains_key(&fd) {
            self.loop_write(fd)?;
        }
        if closed && self.connections.contains_key(&fd) {
            self.loop_close_conn(fd, None)?;
        }
        Ok(Flow::Continue)
    }

    /// One `React` call per datagram, each with its own `conn.peer`
    /// (`spec.md` §4: UDP "connections" are a convenience over one
    /// loop-owned socket — framing here is one datagram per frame, never
    /// concatenated with the next).
    fn loop_read_udp(&mut self, fd: RawFd) -> io::Result<Flow> {
        loop {
            let scratch = &mut self.read_buf;
            let Some(conn) = self.connections.get_mut(&fd) else {
                return Ok(Flow::Continue);
            };
            match conn.recv_one_datagram(scratch) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.loop_close_conn(fd, Some(e))?;
                    return Ok(Flow::Continue);
                }
            }
            self.react_on_buffered_frames(fd)?;
            if !self.connections.contains_key(&fd) {
                return Ok(Flow::Continue);
            }
        }
        if self.connections.contains_key(&fd) {
            self.loop_write(fd)?;
        }
        Ok(Flow::Continue)
    }

    /// Runs the codec/`React` loop over whatever this connection's
    /// `read_accum` currently holds.
    fn react_on_buffered_frames(&mut self, fd: RawFd) -> io::Result<()> {
        let codec = Arc::clone(&self.codec);
        loop {
            let Some(conn) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            let Some(frame) = codec.decode(&mut conn.read_accum) else {
                return Ok(());
            };
            let (out, action) = self.handler.react(frame, conn);
            if let Some(frame_out) = out {
                queue_encoded(conn, &*codec, frame_out);
            }
            let closing = conn.is_closing();
            self.apply_action(action);
            if action == Action::Close || closing {
                self.loop_close_conn(fd, None)?;
                return Ok(());
            }
        }
    }

    fn loop_write(&mut self, fd: RawFd) -> io::Result<Flow> {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(Flow::Continue);
        };
        if !conn.has_pending_output() {
            return Ok(Flow::Continue);
        }
        match conn.flush_pending_output() {
            Ok(true) => {
                let _ = self.reg.mod_read(fd);
            }
            Ok(false) => {
                let _ = self.reg.mod_write(fd);
            }
            Err(e) => {
                self.loop_close_conn(fd, Some(e))?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Tears a connection out of this loop's table and runs `OnClosed`.
    /// `err.is_some()` iff the teardown was triggered by a fatal I/O fault
    /// rather than protocol-driven close (`spec.md` §7).
    pub(crate) fn loop_close_conn(&mut self, fd: RawFd, err: Option<io::Error>) -> io::Result<()> {
        let Some(conn) = self.connections.remove(&fd) else {
            return Ok(());
        };
        let _ = self.reg.delete(fd);
        let action = self.handler.on_closed(&conn, err.as_ref());
        self.apply_action(action);
        Ok(())
    }

    /// Called once on `loop_run` exit: every still-open connection is
    /// closed with no error, matching `spec.md` §4.5 "close all still-open
    /// connections ... via `loopCloseConn(c, nil)`".
    fn close_all_connections(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            if let Err(e) = self.loop_close_conn(fd, None) {
                log::warn!("error closing connection {fd} during loop shutdown: {e}");
            }
        }
    }

    /// Installs a connector handed in via `Server::add_tcp_connector`
    /// (`spec.md` §4.7). Runs as a triggered task on the target loop. A
    /// failed install drops only this connection (same contract as the
    /// `Redistribute` accept path) rather than propagating the error as
    /// the task's own result and killing the loop.
    pub(crate) fn install_connector(
        &mut self,
        stream: mio::net::TcpStream,
        remote_addr: SocketAddr,
        ctx: Option<Box<dyn std::any::Any + Send>>,
    ) -> io::Result<Flow> {
        let fd = stream.as_raw_fd();
        let mut conn = Conn::new_tcp(stream, remote_addr, self.idx);
        conn.ctx = ctx;
        match self.install_local(fd, conn) {
            Ok(flow) => Ok(flow),
            Err(e) => {
                log::warn!("failed to install connector fd {fd} on loop {}: {e}", self.idx);
                self.conn_count.fetch_sub(1, Ordering::Relaxed);
                Ok(Flow::Continue)
            }
        }
    }
}

/// Encodes `frame` through `codec` and queues the result as pending output
/// on `conn`. The only path by which handler-produced output reaches the
/// wire — `Codec::encode` has no effect if callers bypass this and push
/// straight into `Conn::write`.
fn queue_encoded(conn: &mut Conn, codec: &dyn Codec, frame: Bytes) {
    let mut encoded = BytesMut::new();
    codec.encode(frame, &mut encoded);
    if !encoded.is_empty() {
        conn.write(encoded.freeze());
    }
}

/// Drives `poller.poll` until a `Flow::Shutdown` sentinel is observed or a
/// fatal (non-`EINTR`) poller error occurs, then closes every still-open
/// connection this loop owns. This is `spec.md` §4.5 `loop_run`; it is the
/// same function for distributed workers, reactor sub-workers, and the
/// main reactor — only `EventLoop::accept_mode`/`ln` differ.
pub(crate) fn run(
    mut el: EventLoop,
    mut poller: Poller<EventLoop>,
    core: Option<core_affinity::CoreId>,
) {
    if let Some(core) = core {
        core_affinity::set_for_current(core);
    }

    log::debug!("event loop {} starting", el.idx);
    loop {
        match poller.poll(&mut el, Some(Duration::from_millis(1000)), EventLoop::dispatch) {
            Ok(Flow::Continue) => continue,
            Ok(Flow::Shutdown) => {
                log::debug!("event loop {} received shutdown sentinel", el.idx);
                break;
            }
            Err(e) => {
                log::error!("event loop {} poller error: {e}", el.idx);
                break;
            }
        }
    }
    el.close_all_connections();
    log::debug!("event loop {} exiting", el.idx);
}

/// Pre-allocates the read scratch buffer to `cap`, matching `spec.md` §3's
/// `read_buffer_cap` option.
pub(crate) fn new_read_buffer(cap: usize) -> Vec<u8> {
    vec![0u8; cap.max(1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PassthroughCodec;
    use crate::handler::InitAction;
    use crate::listener::init_listener;
    use crate::options::Options;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct RecordingHandler {
        opened: Mutex<Vec<RawFd>>,
        closed: Mutex<Vec<RawFd>>,
    }

    impl EventHandler for RecordingHandler {
        fn on_init_complete(&self, _s: &crate::server::ServerView) -> InitAction {
            InitAction::None
        }
        fn on_opened(&self, conn: &mut Conn) -> (Option<bytes::Bytes>, Action) {
            self.opened.lock().unwrap().push(conn.fd());
            (None, Action::None)
        }
        fn on_closed(&self, conn: &Conn, _err: Option<&io::Error>) -> Action {
            self.closed.lock().unwrap().push(conn.fd());
            Action::None
        }
    }

    fn make_loop(svr: Weak<Inner>) -> EventLoop {
        let poller: Poller<EventLoop> = Poller::open().unwrap();
        let reg = poller.reg().unwrap();
        std::mem::forget(poller); // tests only need `reg`, not a live poll loop
        let conn_count = Arc::new(AtomicUsize::new(0));
        EventLoop {
            idx: 0,
            reg,
            ln: None,
            accept_mode: AcceptMode::Local,
            connections: CountingMap::new(Arc::clone(&conn_count)),
            conn_count,
            read_buf: new_read_buffer(4096),
            svr,
            handler: Arc::new(RecordingHandler {
                opened: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
            }),
            codec: Arc::new(PassthroughCodec),
            tcp_nodelay: false,
            tcp_keepalive: false,
        }
    }

    #[test]
    fn install_local_invokes_on_opened_and_registers_fd() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let opts = Options::default();
        let listener = init_listener("tcp", addr, &opts).unwrap();
        let bound = listener.lnaddr().unwrap();

        let connector = std::net::TcpStream::connect(bound).unwrap();
        connector.set_nonblocking(true).unwrap();
        // Accept synchronously for this unit test; the real accept path
        // runs inside `loop_accept` under a poller.
        let (stream, _addr) = match &listener {
            Listener::Tcp(l) => loop {
                match l.accept() {
                    Ok(pair) => break pair,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => panic!("{e}"),
                }
            },
            _ => unreachable!(),
        };

        let mut el = make_loop(Weak::new());
        let fd = stream.as_raw_fd();
        let conn = Conn::new_tcp(stream, "127.0.0.1:1".parse().unwrap(), 0);
        el.install_local(fd, conn).unwrap();

        assert!(el.connections.contains_key(&fd));
        el.loop_close_conn(fd, None).unwrap();
        assert!(!el.connections.contains_key(&fd));
    }
}
