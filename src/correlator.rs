//! Matching asynchronous responses to the requests that caused them.
//!
//! A request is POSTed; its response shows up later on the event stream,
//! read by a different thread. Each in-flight request owns a single-slot
//! channel registered under its id. The reader hands responses to
//! [`Correlator::deliver`], which never blocks.

use crate::error::{Error, Result};
use crate::jrpc::{Request, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, SyncSender<Value>>>,
}

/// Removes its entry from the map however the wait ends.
struct PendingSlot<'a> {
    correlator: &'a Correlator,
    id: String,
    receiver: Receiver<Value>,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.correlator.lock().remove(&self.id);
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SyncSender<Value>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: String) -> PendingSlot<'_> {
        let (sender, receiver) = std::sync::mpsc::sync_channel(1);
        self.lock().insert(id.clone(), sender);
        PendingSlot {
            correlator: self,
            id,
            receiver,
        }
    }

    /// Number of requests still waiting.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Hands `message` to whoever waits on `id`.
    ///
    /// Returns false when nobody is waiting, which happens routinely for
    /// responses that arrive after their caller timed out.
    pub fn deliver(&self, id: &str, message: Value) -> bool {
        let pending = self.lock();
        match pending.get(id) {
            Some(sender) => match sender.try_send(message) {
                Ok(()) => true,
                // a duplicate response for a filled slot
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }

    /// Wakes every waiter with [`Error::ConnectionLost`].
    pub fn fail_all(&self) {
        self.lock().clear();
    }

    /// Sends one request and waits for its response.
    ///
    /// `submit` transmits the envelope; its error is returned as-is, and the
    /// slot is released either way.
    pub fn send<F>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        submit: F,
    ) -> Result<Response<Value>>
    where
        F: FnOnce(&Request) -> Result<()>,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let slot = self.register(id.clone());
        let request = Request::new(method, params, Value::String(id.clone()));
        submit(&request)?;
        match slot.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(serde_json::from_value(message)?),
            Err(RecvTimeoutError::Timeout) => Err(Error::RequestTimeout {
                id,
                method: method.to_owned(),
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionLost),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::mpsc::channel;

    #[test]
    fn responses_delivered_out_of_order_reach_their_callers() {
        let correlator = Arc::new(Correlator::new());
        let (sent, submitted) = channel::<Request>();

        let mut callers = Vec::new();
        for n in 0..2 {
            let correlator = correlator.clone();
            let sent = sent.clone();
            callers.push(std::thread::spawn(move || {
                let response = correlator
                    .send("tools/call", Some(json!({"n": n})), Duration::from_secs(10), |request| {
                        sent.send(request.clone()).unwrap();
                        Ok(())
                    })
                    .unwrap();
                (n, response.result.unwrap())
            }));
        }

        let first = submitted.recv().unwrap();
        let second = submitted.recv().unwrap();
        for request in [second, first] {
            let id = request.id.as_str().unwrap().to_owned();
            let n = request.params.unwrap()["n"].clone();
            let response = Response::new(json!({"echo": n}), request.id);
            assert!(correlator.deliver(&id, serde_json::to_value(response).unwrap()));
        }

        for caller in callers {
            let (n, result) = caller.join().unwrap();
            assert_eq!(result, json!({"echo": n}));
        }
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn timeout_releases_the_slot() {
        let correlator = Correlator::new();
        let result = correlator.send("tools/list", None, Duration::from_millis(20), |_| Ok(()));
        assert!(matches!(result, Err(Error::RequestTimeout { ref method, .. }) if method == "tools/list"));
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn rejected_submission_releases_the_slot() {
        let correlator = Correlator::new();
        let result = correlator.send("tools/list", None, Duration::from_secs(10), |_| {
            Err(Error::SubmissionRejected(500))
        });
        assert!(matches!(result, Err(Error::SubmissionRejected(500))));
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn late_response_is_dropped() {
        let correlator = Correlator::new();
        assert!(!correlator.deliver("nobody", json!({"id": "nobody"})));
    }

    #[test]
    fn fail_all_wakes_waiters() {
        let correlator = Arc::new(Correlator::new());
        let (sent, submitted) = channel::<()>();
        let waiter = {
            let correlator = correlator.clone();
            std::thread::spawn(move || {
                correlator.send("tools/list", None, Duration::from_secs(10), |_| {
                    sent.send(()).unwrap();
                    Ok(())
                })
            })
        };
        submitted.recv().unwrap();
        correlator.fail_all();
        assert!(matches!(waiter.join().unwrap(), Err(Error::ConnectionLost)));
    }
}
