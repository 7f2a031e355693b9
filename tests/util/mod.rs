// Not all functions are used by every integration test.
#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    })
}

/// Polls `check` with a short backoff instead of a single fixed sleep,
/// matching the teacher's own `expect_events`-style bounded retry tests
/// rather than an arbitrary `thread::sleep`.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
