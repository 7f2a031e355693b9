use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use socket2::{Socket, TcpKeepalive};

use crate::listener::Listener;

/// Which kernel socket a `Conn` wraps. UDP "connections" are a convenience
/// over one loop-owned, never-closed listener socket (see `spec.md`'s Open
/// Questions on shared UDP listeners): the pseudo-connection holds the same
/// `Arc<Listener>` the owning loop registered for reads, rather than a
/// socket of its own. TCP connections are per-accept and own their stream
/// outright.
pub enum ConnKind {
    Tcp(TcpStream),
    Udp(Arc<Listener>),
}

/// Per-connection state. `spec.md` §1 calls the internals of this type —
/// ring buffers and codec/framing — external, but a runnable crate needs
/// a default; this one is intentionally simple (accumulate-then-decode,
/// `VecDeque<Bytes>` pending output) rather than a true ring buffer.
pub struct Conn {
    pub(crate) fd: RawFd,
    pub(crate) kind: ConnKind,
    pub(crate) peer: SocketAddr,
    /// Loop index this connection is pinned to, for diagnostics and for
    /// `least_connections` bookkeeping.
    pub(crate) loop_idx: i32,
    /// Accumulated, not-yet-decoded input.
    pub(crate) read_accum: BytesMut,
    /// Frames encoded and queued for write but not yet flushed.
    pub(crate) pending_out: VecDeque<Bytes>,
    /// Opaque user context, populated by `Server::add_tcp_connector`.
    pub ctx: Option<Box<dyn Any + Send>>,
    pub(crate) closing: bool,
}

impl Conn {
    pub(crate) fn new_tcp(stream: TcpStream, peer: SocketAddr, loop_idx: i32) -> Self {
        Conn {
            fd: stream.as_raw_fd(),
            kind: ConnKind::Tcp(stream),
            peer,
            loop_idx,
            read_accum: BytesMut::new(),
            pending_out: VecDeque::new(),
            ctx: None,
            closing: false,
        }
    }

    pub(crate) fn new_udp(listener: Arc<Listener>, loop_idx: i32) -> Self {
        let fd = listener.fd();
        Conn {
            fd,
            kind: ConnKind::Udp(listener),
            peer: "0.0.0.0:0".parse().unwrap(),
            loop_idx,
            read_accum: BytesMut::new(),
            pending_out: VecDeque::new(),
            ctx: None,
            closing: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn loop_idx(&self) -> i32 {
        self.loop_idx
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.kind, ConnKind::Udp(_))
    }

    /// Schedules `bytes` for output; actually written on the next
    /// writable readiness (or immediately, opportunistically, by
    /// `loopWrite`).
    pub fn write(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.pending_out.push_back(bytes);
        }
    }

    /// Marks this connection to be torn down once the current dispatch
    /// callback returns, the idiomatic alternative to returning
    /// `Action::Close` when a handler wants to close from deeper in its
    /// own call stack than the callback's return value reaches.
    pub fn close(&mut self) {
        self.closing = true;
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.pending_out.is_empty()
    }

    /// Applies `options.tcp_nodelay`/`options.tcp_keepalive` to an
    /// accepted or connector-attached stream. A no-op for UDP
    /// pseudo-connections, which have neither setting.
    pub(crate) fn apply_tcp_options(&self, nodelay: bool, keepalive: bool) -> io::Result<()> {
        let ConnKind::Tcp(stream) = &self.kind else {
            return Ok(());
        };
        if nodelay {
            stream.set_nodelay(true)?;
        }
        if keepalive {
            // `mio::net::TcpStream` exposes no keepalive knob; wrap the
            // raw fd in a `socket2::Socket` just long enough to set it,
            // then forget the wrapper so it doesn't close the fd `stream`
            // still owns.
            let raw = stream.as_raw_fd();
            let sock = ManuallyDrop::new(unsafe { Socket::from_raw_fd(raw) });
            let ka = TcpKeepalive::new().with_time(Duration::from_secs(60));
            sock.set_tcp_keepalive(&ka)?;
        }
        Ok(())
    }

    /// Drains a TCP stream into `scratch`, appending to `read_accum`, until
    /// `WouldBlock`. Mirrors the loop in `mio`'s own
    /// `examples/tcp_server.rs::handle_connection_event`. Returns `true` if
    /// the peer closed the connection. UDP pseudo-connections use
    /// [`Conn::recv_one_datagram`] instead, since datagram boundaries (and
    /// the sender address per-datagram) must be preserved rather than
    /// concatenated.
    pub(crate) fn fill_read_accum(&mut self, scratch: &mut [u8]) -> io::Result<bool> {
        let ConnKind::Tcp(stream) = &mut self.kind else {
            return Ok(false);
        };
        loop {
            match stream.read(scratch) {
                Ok(0) => return Ok(true),
                Ok(n) => self.read_accum.extend_from_slice(&scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Receives exactly one datagram into `read_accum`, replacing whatever
    /// was there, so each packet keeps its own framing and its own
    /// `peer` rather than being concatenated with the next one read in the
    /// same readiness burst. Returns `false` on `WouldBlock` (nothing more
    /// to drain this readiness).
    pub(crate) fn recv_one_datagram(&mut self, scratch: &mut [u8]) -> io::Result<bool> {
        let ConnKind::Udp(listener) = &self.kind else {
            return Ok(false);
        };
        loop {
            match listener.recv_from(scratch) {
                Ok((n, from)) => {
                    self.peer = from;
                    self.read_accum.clear();
                    self.read_accum.extend_from_slice(&scratch[..n]);
                    return Ok(true);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Flushes as much of `pending_out` as the socket will currently
    /// accept. Returns `true` once the queue is fully drained.
    pub(crate) fn flush_pending_output(&mut self) -> io::Result<bool> {
        while let Some(front) = self.pending_out.front() {
            let wrote = match &mut self.kind {
                ConnKind::Tcp(stream) => stream.write(front),
                ConnKind::Udp(listener) => listener.send_to(front, self.peer),
            };
            match wrote {
                Ok(n) if n == front.len() => {
                    self.pending_out.pop_front();
                }
                Ok(n) => {
                    let remainder = front.slice(n..);
                    self.pending_out.pop_front();
                    self.pending_out.push_front(remainder);
                    return Ok(false);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
