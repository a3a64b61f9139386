//! Outstanding-call table.
//!
//! A [`CallCorrelator`] belongs to exactly one session and is only touched
//! under that session's lock. Every invoke registers an entry keyed by a
//! fresh [`CallId`]; the entry leaves the table exactly once, through one of:
//!
//! - a matching response ([`resolve`](CallCorrelator::resolve))
//! - its ack timer firing ([`expire`](CallCorrelator::expire))
//! - a silent withdrawal ([`cancel`](CallCorrelator::cancel))
//! - connection loss ([`abort_all`](CallCorrelator::abort_all))
//!
//! Removing an entry aborts its timer in the same step, so a timer that
//! fires late finds nothing to expire.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::envelope::ResponseEnvelope;
use crate::errors::{BadConnectionError, CallError, ConnectionLossKind, TimeoutError};
use crate::ids::CallId;

/// Outcome delivered to the caller of an invoke.
pub type CallResult = Result<Value, CallError>;

/// Receiving half handed to the caller of an invoke.
pub type CallReceiver = oneshot::Receiver<CallResult>;

struct PendingCall {
    event: String,
    responder: oneshot::Sender<CallResult>,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn settle(self, result: CallResult) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let _ = self.responder.send(result);
    }
}

/// Pending invokes of one session.
pub struct CallCorrelator {
    next_cid: u64,
    pending: HashMap<CallId, PendingCall>,
}

impl Default for CallCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl CallCorrelator {
    /// Create an empty table. The first call id is 1.
    pub fn new() -> Self {
        Self {
            next_cid: 1,
            pending: HashMap::new(),
        }
    }

    /// Register an invoke of `event` and return its id and result receiver.
    pub fn register(&mut self, event: &str) -> (CallId, CallReceiver) {
        let cid = CallId(self.next_cid);
        self.next_cid += 1;
        let (responder, receiver) = oneshot::channel();
        let _ = self.pending.insert(
            cid,
            PendingCall {
                event: event.to_string(),
                responder,
                timer: None,
            },
        );
        (cid, receiver)
    }

    /// Attach the ack timer guarding `cid`.
    ///
    /// If the call is already gone the timer is aborted immediately.
    pub fn attach_timer(&mut self, cid: CallId, timer: AbortHandle) {
        match self.pending.get_mut(&cid) {
            Some(call) => call.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Settle the call a response refers to. Returns `false` for unknown ids.
    pub fn resolve(&mut self, response: ResponseEnvelope) -> bool {
        let rid = response.rid;
        let Some(call) = self.pending.remove(&rid) else {
            debug!(%rid, "response for unknown call id");
            return false;
        };
        call.settle(response.into_result().map_err(CallError::Remote));
        true
    }

    /// Reject `cid` with a [`TimeoutError`] naming its event.
    pub fn expire(&mut self, cid: CallId) -> bool {
        let Some(call) = self.pending.remove(&cid) else {
            return false;
        };
        let err = TimeoutError {
            event: call.event.clone(),
        };
        debug!(%cid, event = %call.event, "call timed out");
        call.settle(Err(err.into()));
        true
    }

    /// Reject `cid` with an arbitrary error, e.g. when its frame could not
    /// be written.
    pub fn reject(&mut self, cid: CallId, err: CallError) -> bool {
        let Some(call) = self.pending.remove(&cid) else {
            return false;
        };
        call.settle(Err(err));
        true
    }

    /// Withdraw `cid` without delivering any outcome.
    pub fn cancel(&mut self, cid: CallId) -> bool {
        match self.pending.remove(&cid) {
            Some(call) => {
                if let Some(timer) = call.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Reject every pending call with a [`BadConnectionError`].
    ///
    /// Calls are rejected in id order. Returns how many were rejected.
    pub fn abort_all(&mut self, kind: ConnectionLossKind) -> usize {
        let mut calls: Vec<_> = self.pending.drain().collect();
        calls.sort_unstable_by_key(|(cid, _)| *cid);
        let count = calls.len();
        for (_, call) in calls {
            let err = BadConnectionError {
                event: call.event.clone(),
                kind,
            };
            call.settle(Err(err.into()));
        }
        count
    }

    /// Whether `cid` is still pending.
    pub fn contains(&self, cid: CallId) -> bool {
        self.pending.contains_key(&cid)
    }

    /// Event name of a pending call.
    pub fn event_of(&self, cid: CallId) -> Option<&str> {
        self.pending.get(&cid).map(|call| call.event.as_str())
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no calls are pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Drop for CallCorrelator {
    fn drop(&mut self) {
        for call in self.pending.values() {
            if let Some(timer) = &call.timer {
                timer.abort();
            }
        }
    }
}

/// Spawn a timer task that runs `on_expire` after `delay`.
///
/// The returned handle is meant for [`CallCorrelator::attach_timer`].
pub fn spawn_timer<F>(delay: Duration, on_expire: F) -> AbortHandle
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        on_expire();
    })
    .abort_handle()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
