use std::time::Duration;

use bytes::Bytes;

use crate::conn::Conn;
use crate::server::ServerView;

/// Token returned by handler callbacks to steer subsequent core behavior.
/// Deliberately a plain enum rather than an exception — see `spec.md` §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Close,
    Shutdown,
}

/// Returned by `OnInitComplete`, which has no `Close` action (there is no
/// connection to close yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitAction {
    None,
    Shutdown,
}

/// Returned by `OnTick`: a delay until the next tick, and an action.
#[derive(Debug, Clone, Copy)]
pub struct TickResult {
    pub delay: Duration,
    pub action: Action,
}

impl TickResult {
    pub fn next_after(delay: Duration) -> Self {
        TickResult {
            delay,
            action: Action::None,
        }
    }

    pub fn shutdown() -> Self {
        TickResult {
            delay: Duration::from_secs(0),
            action: Action::Shutdown,
        }
    }
}

/// The user-supplied capability set the core invokes. See `spec.md` §6.
///
/// Every method has a default no-op implementation except the ones that
/// must produce a value (`React`); implement only what your server needs.
/// All callbacks run exclusively on the owning loop's thread and must not
/// block (`spec.md` §5).
pub trait EventHandler: Send + Sync {
    /// Invoked once, after all loops are constructed but before any thread
    /// starts polling. Returning `Shutdown` aborts startup entirely: no
    /// loop thread is ever spawned.
    fn on_init_complete(&self, _server: &ServerView) -> InitAction {
        InitAction::None
    }

    /// Invoked once, on the supervisor thread, at the start of the shutdown
    /// sequence (`spec.md` §4.9 step 2).
    fn on_shutdown(&self, _server: &ServerView) {}

    /// A connection was just installed into its owning loop. Returning
    /// bytes here schedules them as the first write.
    fn on_opened(&self, _conn: &mut Conn) -> (Option<Bytes>, Action) {
        (None, Action::None)
    }

    /// A connection was torn down, either per protocol (`err` is `None`) or
    /// due to a fatal I/O error.
    fn on_closed(&self, _conn: &Conn, _err: Option<&std::io::Error>) -> Action {
        Action::None
    }

    /// A frame was decoded from a connection's read side. Returning bytes
    /// schedules them as output on the same connection.
    fn react(&self, _frame: Bytes, _conn: &mut Conn) -> (Option<Bytes>, Action) {
        (None, Action::None)
    }

    /// Invoked periodically on the ticker host loop when `options.ticker`
    /// is set.
    fn on_tick(&self) -> TickResult {
        TickResult::next_after(Duration::from_secs(1))
    }
}
