//! Thread helpers.
//!
//! Everything in this crate runs on plain OS threads; there is no async
//! runtime. Teardown needs to wait for those threads without risking a hang,
//! which is what this module provides.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often [`join_with_timeout`] checks on the thread.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Joins `handle`, giving up after `timeout`.
///
/// Returns false if the thread was still running; it is then detached and
/// left to finish on its own.
///
/// ```
/// use mcp_link::sys::join_with_timeout;
/// use std::time::Duration;
///
/// let quick = std::thread::spawn(|| {});
/// assert!(join_with_timeout(quick, Duration::from_secs(1)));
/// ```
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            logwise::warn_sync!(
                "Thread {name} did not finish within {timeout}; detaching",
                name = logwise::privacy::LogIt(&handle.thread().name().map(str::to_owned)),
                timeout = logwise::privacy::LogIt(&timeout)
            );
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    if handle.join().is_err() {
        logwise::error_sync!("A joined thread had panicked");
    }
    true
}
