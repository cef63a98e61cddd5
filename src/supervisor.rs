//! Keeps the control-plane connection alive.
//!
//! The supervisor owns one background thread. Each cycle it asks a
//! [`Lifecycle`] to connect; on success it stays in [`Lifecycle::listen`]
//! until the connection drops, then backs off and tries again:
//!
//! ```text
//! Idle -> Connecting -> Connected -> (listen returns) -> Backoff -> Connecting ...
//!              \-------- error / panic ---------------> Backoff
//! any state -- stop --> Stopped
//! ```
//!
//! Backoff waits `min(2^retry, max)` seconds and is interruptible by the
//! [`StopSignal`], so stopping never waits out a long delay.

use crate::error::Result;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Connected,
    Backoff,
    Stopped,
}

/// The wait before attempt `retry_count + 1`, capped at `max`.
///
/// ```
/// use mcp_link::supervisor::backoff_delay;
/// use std::time::Duration;
///
/// let max = Duration::from_secs(60);
/// assert_eq!(backoff_delay(1, max), Duration::from_secs(2));
/// assert_eq!(backoff_delay(5, max), Duration::from_secs(32));
/// assert_eq!(backoff_delay(6, max), max);
/// ```
pub fn backoff_delay(retry_count: u32, max: Duration) -> Duration {
    let secs = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(max)
}

/// A sticky stop flag that sleepers can wait on.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self) {
        *self.lock() = true;
        self.changed.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Sleeps up to `timeout`. Returns true if the signal is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub state: State,
    pub retry_count: u32,
    /// Set while in [`State::Backoff`].
    pub next_delay: Option<Duration>,
}

/// What the supervisor is doing, observable from any thread.
#[derive(Debug)]
pub struct SupervisorStatus {
    snapshot: Mutex<Snapshot>,
    changed: Condvar,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        SupervisorStatus {
            snapshot: Mutex::new(Snapshot {
                state: State::Idle,
                retry_count: 0,
                next_delay: None,
            }),
            changed: Condvar::new(),
        }
    }
}

impl SupervisorStatus {
    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Snapshot {
        *self.lock()
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Stopped is terminal: once published, later transitions are ignored.
    fn publish(&self, state: State, retry_count: u32, next_delay: Option<Duration>) {
        let mut snapshot = self.lock();
        if snapshot.state == State::Stopped {
            return;
        }
        *snapshot = Snapshot {
            state,
            retry_count,
            next_delay,
        };
        drop(snapshot);
        self.changed.notify_all();
    }

    /// Publishes the terminal state.
    pub(crate) fn mark_stopped(&self) {
        let retry_count = self.lock().retry_count;
        self.publish(State::Stopped, retry_count, None);
    }

    /// Blocks until `predicate` holds for the current snapshot, up to `timeout`.
    pub fn wait_for<F>(&self, mut predicate: F, timeout: Duration) -> Option<Snapshot>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |snapshot| !predicate(snapshot))
            .unwrap_or_else(PoisonError::into_inner);
        predicate(&guard).then_some(*guard)
    }
}

/// One connection's worth of work, driven by [`Supervisor::run`].
pub trait Lifecycle {
    /// Establishes a connection. Any error sends the supervisor to backoff.
    fn connect(&mut self) -> Result<()>;
    /// Blocks until the connection drops or `stop` is set.
    fn listen(&mut self, stop: &StopSignal);
    /// Releases whatever `connect` acquired. Called after every cycle.
    fn disconnect(&mut self);
}

pub struct Supervisor<L> {
    lifecycle: L,
    stop: Arc<StopSignal>,
    status: Arc<SupervisorStatus>,
    max_retry_delay: Duration,
}

impl<L: Lifecycle> Supervisor<L> {
    pub fn new(
        lifecycle: L,
        stop: Arc<StopSignal>,
        status: Arc<SupervisorStatus>,
        max_retry_delay: Duration,
    ) -> Self {
        Supervisor {
            lifecycle,
            stop,
            status,
            max_retry_delay,
        }
    }

    /// Runs cycles until the stop signal is set.
    pub fn run(mut self) {
        let mut retry_count: u32 = 0;
        while !self.stop.is_set() {
            self.status.publish(State::Connecting, retry_count, None);
            let attempt = catch_unwind(AssertUnwindSafe(|| self.lifecycle.connect()));
            match attempt {
                Ok(Ok(())) if self.stop.is_set() => {
                    self.release();
                    break;
                }
                Ok(Ok(())) => {
                    retry_count = 0;
                    self.status.publish(State::Connected, retry_count, None);
                    logwise::info_sync!("Connected to the control plane");
                    let stop = &self.stop;
                    let lifecycle = &mut self.lifecycle;
                    if catch_unwind(AssertUnwindSafe(|| lifecycle.listen(stop))).is_err() {
                        logwise::error_sync!("Listener panicked");
                    }
                    self.release();
                    if self.stop.is_set() {
                        break;
                    }
                    logwise::warn_sync!("Connection to the control plane dropped");
                    retry_count = 1;
                }
                Ok(Err(e)) => {
                    self.release();
                    retry_count = retry_count.saturating_add(1);
                    logwise::warn_sync!(
                        "Connection attempt failed: {error}",
                        error = logwise::privacy::LogIt(&e.to_string())
                    );
                }
                Err(_) => {
                    self.release();
                    retry_count = retry_count.saturating_add(1);
                    logwise::error_sync!("Connection attempt panicked");
                }
            }
            if self.stop.is_set() {
                break;
            }

            let delay = backoff_delay(retry_count, self.max_retry_delay);
            self.status.publish(State::Backoff, retry_count, Some(delay));
            logwise::info_sync!(
                "Retrying in {delay} (attempt {retry})",
                delay = logwise::privacy::LogIt(&delay),
                retry = logwise::privacy::LogIt(&retry_count)
            );
            if self.stop.wait(delay) {
                break;
            }
        }
        self.status.mark_stopped();
        logwise::info_sync!("Supervisor stopped");
    }

    fn release(&mut self) {
        if catch_unwind(AssertUnwindSafe(|| self.lifecycle.disconnect())).is_err() {
            logwise::error_sync!("Disconnect panicked");
        }
    }
}
