//! The crate's own wrapper around `mio`'s kernel multiplexer.
//!
//! `spec.md` puts "the low-level poller (kernel multiplexer wrapper)" out
//! of scope and describes its contract in the abstract (`add_read`,
//! `mod_write`, `delete`, `poll`, `trigger`, `close`). `mio` supplies the
//! actual epoll/kqueue syscalls through `Poll`/`Registry`/`Waker`, but
//! nothing in the ecosystem bundles those into a single type with an
//! ordered, thread-safe `trigger` queue — so this module builds exactly
//! that, per design note §9 of `spec.md`: "a lock-free MPSC queue + a
//! wakeup FD ... read at the top of each poll iteration." This is the only
//! module in the crate that touches `mio::Poll` directly.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

/// A cheaply-cloneable handle to one loop's registration table, independent
/// of the `Poll`/`Events` pair that must stay on the polling thread. Mirrors
/// `mio::Registry::try_clone`, which exists precisely so registration can be
/// driven from code that doesn't own the `Poll` itself (here: the event
/// loop's own connection-handling methods, called from inside `poll`'s
/// `on_event` callback, which only ever borrows the loop's state — never the
/// `Poller` wrapping it).
#[derive(Clone)]
pub struct Reg(Registry);

impl Reg {
    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.0
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    pub fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.0.register(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE.add(Interest::WRITABLE),
        )
    }

    pub fn mod_write(&self, fd: RawFd) -> io::Result<()> {
        self.0.reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE.add(Interest::WRITABLE),
        )
    }

    pub fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.0
            .reregister(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.0.deregister(&mut SourceFd(&fd))
    }
}

/// What a readiness event or a triggered task wants the run loop to do
/// next. `Shutdown` is the sentinel from `spec.md` §6/§7: it must
/// short-circuit the current poll iteration and cause the loop to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Readable/writable/closed bits for one event. `spec.md` §4.5 shows the
/// BSD-filter form and notes "epoll variants carry a read/write bitmask
/// equivalently" — this crate targets epoll/kqueue through `mio`, so a
/// bitmask is the natural representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags {
    pub readable: bool,
    pub writable: bool,
    /// Peer closed or a read/write error was reported by the kernel.
    pub closed: bool,
}

/// A unit of cross-loop work. Runs exactly once, on the owning loop's
/// thread, with exclusive access to that loop's state (`spec.md` §4.5
/// "Wakeup / cross-loop submission").
pub type Task<T> = Box<dyn FnOnce(&mut T) -> io::Result<Flow> + Send>;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Cloneable, `Send + Sync` handle for submitting tasks to one loop from
/// any thread. This is the `trigger` half of the poller contract.
#[derive(Clone)]
pub struct PollerHandle<T> {
    tx: Sender<Task<T>>,
    waker: Arc<Waker>,
}

impl<T> PollerHandle<T> {
    /// Enqueues `task` and wakes the owning loop's `poll` call. Safe to
    /// call from any thread; preserves submission order per-sender
    /// (`spec.md` §5 "Cross-loop ordering").
    pub fn trigger(&self, task: Task<T>) -> io::Result<()> {
        self.tx
            .send(task)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poller shut down"))?;
        self.waker.wake()
    }
}

/// Owns one loop's kernel multiplexer handle, its wakeup primitive, and
/// its task queue. `T` is the context type tasks and the `poll` callback
/// receive — in this crate, always the owning `EventLoop`.
pub struct Poller<T> {
    poll: Poll,
    waker: Arc<Waker>,
    task_tx: Sender<Task<T>>,
    task_rx: Receiver<Task<T>>,
    events: Events,
}

impl<T> Poller<T> {
    pub fn open() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        Ok(Poller {
            poll,
            waker,
            task_tx,
            task_rx,
            events: Events::with_capacity(1024),
        })
    }

    pub fn handle(&self) -> PollerHandle<T> {
        PollerHandle {
            tx: self.task_tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    /// A cloned registration handle, safe to store on the loop's own state
    /// and use from inside `on_event`/trigger callbacks without re-borrowing
    /// this `Poller`.
    pub fn reg(&self) -> io::Result<Reg> {
        Ok(Reg(self.poll.registry().try_clone()?))
    }

    fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    pub fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.registry().register(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE.add(Interest::WRITABLE),
        )
    }

    /// Re-registers for both directions: there's pending output but reads
    /// must keep flowing too (matches `mio`'s own `tcp_server.rs` example
    /// for the case where a write would block mid-stream).
    pub fn mod_write(&self, fd: RawFd) -> io::Result<()> {
        self.registry().reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE.add(Interest::WRITABLE),
        )
    }

    /// Drops back to read-only interest once the pending-output queue is
    /// fully drained.
    pub fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.registry().deregister(&mut SourceFd(&fd))
    }

    /// Waits for readiness events (or a trigger wakeup), drains the task
    /// queue, then dispatches each readiness event through `on_event`.
    /// Returns `Flow::Shutdown` as soon as either a task or `on_event`
    /// asks for it — the remainder of this iteration's events are
    /// dropped, not processed, matching the sentinel's short-circuit
    /// contract.
    pub fn poll(
        &mut self,
        ctx: &mut T,
        timeout: Option<Duration>,
        mut on_event: impl FnMut(&mut T, RawFd, EventFlags) -> io::Result<Flow>,
    ) -> io::Result<Flow> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Flow::Continue),
            Err(err) => return Err(err),
        }

        // Task queue is drained at the top of the iteration, per design
        // note §9, so a trigger observed in this wakeup runs before any
        // readiness event from the same wakeup.
        while let Ok(task) = self.task_rx.try_recv() {
            if task(ctx)? == Flow::Shutdown {
                return Ok(Flow::Shutdown);
            }
        }

        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let fd = event.token().0 as RawFd;
            let flags = EventFlags {
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_read_closed() || event.is_write_closed() || event.is_error(),
            };
            if on_event(ctx, fd, flags)? == Flow::Shutdown {
                return Ok(Flow::Shutdown);
            }
        }

        Ok(Flow::Continue)
    }

    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Counter(u32);

    #[test]
    fn trigger_wakes_a_blocked_poll() {
        let mut poller: Poller<Counter> = Poller::open().unwrap();
        let handle = poller.handle();
        let mut ctx = Counter(0);

        let t = thread::spawn(move || {
            handle
                .trigger(Box::new(|ctx: &mut Counter| {
                    ctx.0 += 1;
                    Ok(Flow::Continue)
                }))
                .unwrap();
        });

        let flow = poller
            .poll(&mut ctx, Some(Duration::from_secs(5)), |_, _, _| {
                Ok(Flow::Continue)
            })
            .unwrap();
        t.join().unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(ctx.0, 1);
    }

    #[test]
    fn trigger_returning_shutdown_short_circuits() {
        let mut poller: Poller<Counter> = Poller::open().unwrap();
        let handle = poller.handle();
        let mut ctx = Counter(0);

        handle
            .trigger(Box::new(|_| Ok(Flow::Shutdown)))
            .unwrap();

        let flow = poller
            .poll(&mut ctx, Some(Duration::from_secs(5)), |_, _, _| {
                Ok(Flow::Continue)
            })
            .unwrap();
        assert_eq!(flow, Flow::Shutdown);
    }

    #[test]
    fn triggers_from_one_sender_run_in_submission_order() {
        let mut poller: Poller<Counter> = Poller::open().unwrap();
        let handle = poller.handle();
        let mut ctx = Counter(0);

        for expected in 1..=5u32 {
            let h = handle.clone();
            h.trigger(Box::new(move |ctx: &mut Counter| {
                assert_eq!(ctx.0 + 1, expected);
                ctx.0 = expected;
                Ok(Flow::Continue)
            }))
            .unwrap();
        }

        poller
            .poll(&mut ctx, Some(Duration::from_secs(5)), |_, _, _| {
                Ok(Flow::Continue)
            })
            .unwrap();
        assert_eq!(ctx.0, 5);
    }
}
