//! The periodic `OnTick` task from `spec.md` §4.8: runs outside any poll
//! loop, on its own thread, cancellable within at most one tick interval.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::handler::{Action, EventHandler};
use crate::server::Inner;

/// Handle for cancelling a running ticker. Cancellation is observed the
/// next time the ticker thread wakes (on its own timeout or on `cancel`),
/// so it is prompt at the next tick boundary per `spec.md` §5.
pub(crate) struct TickerHandle {
    cancel_tx: Sender<()>,
}

impl TickerHandle {
    pub(crate) fn cancel(&self) {
        // Best-effort: if the thread already exited the channel send fails
        // silently, which is fine — there's nothing left to cancel.
        let _ = self.cancel_tx.send(());
    }
}

/// Spawns the ticker thread. `handler.on_tick()` is invoked repeatedly,
/// waiting `delay` between calls; `Action::Shutdown` routes through
/// `signal_shutdown` exactly like any other handler-initiated shutdown
/// (`spec.md` §5 "Cancellation").
pub(crate) fn spawn(handler: Arc<dyn EventHandler>, svr: Weak<Inner>) -> (JoinHandle<()>, TickerHandle) {
    let (cancel_tx, cancel_rx) = bounded(1);

    let join = thread::Builder::new()
        .name("rotor-ticker".into())
        .spawn(move || {
            let mut delay = Duration::from_secs(0);
            loop {
                match cancel_rx.recv_timeout(delay) {
                    Ok(()) => {
                        log::debug!("ticker cancelled");
                        return;
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                let result = handler.on_tick();
                delay = result.delay;
                match result.action {
                    Action::Shutdown => {
                        if let Some(s) = svr.upgrade() {
                            s.signal_shutdown();
                        }
                        return;
                    }
                    Action::Close | Action::None => {}
                }
            }
        })
        .expect("failed to spawn ticker thread");

    (join, TickerHandle { cancel_tx })
}
