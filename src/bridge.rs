//! Moving work onto the host's main thread.
//!
//! Reverse calls arrive on background threads, but the host only allows its
//! object model to be touched from one designated thread. The bridge is the
//! hand-off point:
//!
//! 1. a background thread [`enqueue`](WorkBridge::enqueue)s a payload and
//!    blocks on the returned [`Ticket`];
//! 2. the host's main loop calls [`drain`](WorkBridge::drain) on every tick,
//!    which runs a bounded batch of queued items through a handler;
//! 3. each result is handed back through the item's single-slot channel.
//!
//! # Guarantees
//!
//! - Each item is executed at most once and answered at most once.
//! - A drain processes at most `batch_size` items, so one tick never stalls
//!   the host for long. Leftovers wait for the next tick.
//! - Drains never overlap. A drain that finds another one in progress
//!   returns [`DrainOutcome::Busy`] immediately instead of waiting; this
//!   also makes a re-entrant drain from inside a handler harmless.
//! - A handler error or panic becomes an error-shaped [`ToolResult`] for that
//!   item and the batch carries on.
//! - Once [`close`](WorkBridge::close)d, the bridge drops what is queued and
//!   refuses new items; their tickets fail with [`Error::WorkItemCancelled`]
//!   at once instead of waiting out their timeout.
//!
//! # Example
//!
//! ```
//! use mcp_link::bridge::{DrainOutcome, WorkBridge};
//! use mcp_link::tools::ToolResult;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let bridge = WorkBridge::new(5);
//! let ticket = bridge.enqueue(json!({"code": "1 + 1"}));
//!
//! // normally called from the host's main loop
//! let outcome = bridge.drain(|payload| Ok(ToolResult::text(payload["code"].to_string())));
//! assert_eq!(outcome, DrainOutcome::Drained(1));
//!
//! let result = ticket.wait(Duration::from_secs(1)).unwrap();
//! assert_eq!(result.first_text(), Some("\"1 + 1\""));
//! ```

use crate::error::{Error, Result};
use crate::tools::ToolResult;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct WorkItem {
    payload: Value,
    completion: SyncSender<ToolResult>,
}

/// The waiting side of one queued item.
#[derive(Debug)]
pub struct Ticket {
    receiver: Receiver<ToolResult>,
}

impl Ticket {
    /// Blocks until the item has run, or `timeout` passes.
    ///
    /// A timed-out item stays queued; when it eventually runs its result is
    /// discarded.
    pub fn wait(self, timeout: Duration) -> Result<ToolResult> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => Err(Error::WorkItemTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::WorkItemCancelled),
        }
    }
}

/// What a call to [`WorkBridge::drain`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain was already running; nothing was touched.
    Busy,
    /// This many items were executed.
    Drained(usize),
}

/// Held for the duration of one drain.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<WorkItem>,
    closed: bool,
}

/// A queue of work items executed on the host's main thread.
#[derive(Debug)]
pub struct WorkBridge {
    queue: Mutex<Queue>,
    draining: AtomicBool,
    batch_size: usize,
}

impl WorkBridge {
    pub fn new(batch_size: usize) -> Self {
        WorkBridge {
            queue: Mutex::new(Queue::default()),
            draining: AtomicBool::new(false),
            batch_size: batch_size.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `payload` without waiting for it.
    ///
    /// On a closed bridge nothing is queued and the ticket is already cancelled.
    pub fn enqueue(&self, payload: Value) -> Ticket {
        let (completion, receiver) = std::sync::mpsc::sync_channel(1);
        let mut queue = self.lock();
        if !queue.closed {
            queue.items.push_back(WorkItem {
                payload,
                completion,
            });
        }
        Ticket { receiver }
    }

    /// Queues `payload` and waits up to `timeout` for its result.
    pub fn submit(&self, payload: Value, timeout: Duration) -> Result<ToolResult> {
        self.enqueue(payload).wait(timeout)
    }

    /// Items queued and not yet taken by a drain.
    pub fn pending(&self) -> usize {
        self.lock().items.len()
    }

    /// Refuses further items and drops the queued ones. Returns how many were dropped.
    pub fn close(&self) -> usize {
        let mut queue = self.lock();
        queue.closed = true;
        let dropped = queue.items.len();
        queue.items.clear();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Runs up to one batch of queued items through `handler`.
    ///
    /// Call this from the main thread only.
    pub fn drain<F>(&self, mut handler: F) -> DrainOutcome
    where
        F: FnMut(Value) -> Result<ToolResult>,
    {
        let Some(_guard) = DrainGuard::try_acquire(&self.draining) else {
            return DrainOutcome::Busy;
        };
        let mut processed = 0;
        while processed < self.batch_size {
            let Some(item) = self.lock().items.pop_front() else {
                break;
            };
            let payload = item.payload;
            let result = match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => ToolResult::error(e),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    logwise::error_sync!(
                        "Work item handler panicked: {message}",
                        message = logwise::privacy::LogIt(&message)
                    );
                    ToolResult::error(message)
                }
            };
            // the waiter may already have timed out
            let _ = item.completion.try_send(result);
            processed += 1;
        }
        DrainOutcome::Drained(processed)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}
