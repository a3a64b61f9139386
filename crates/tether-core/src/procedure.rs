//! Inbound invokes awaiting an answer.
//!
//! A [`ProcedureRequest`] is what a procedure reader yields. It carries the
//! event payload and a one-shot responder: the first [`end`] or [`error`]
//! sends the response envelope, any later attempt fails with
//! [`InvalidActionError`]. Clones share the responder, so every reader of
//! the same procedure name races for the single answer.
//!
//! [`end`]: ProcedureRequest::end
//! [`error`]: ProcedureRequest::error

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::envelope::ResponseEnvelope;
use crate::errors::{InvalidActionError, WireError};
use crate::ids::CallId;

/// Where response envelopes go.
pub trait ResponseSink: Send + Sync {
    /// Deliver one response envelope to the peer.
    fn send_response(&self, response: ResponseEnvelope);
}

impl<F> ResponseSink for F
where
    F: Fn(ResponseEnvelope) + Send + Sync,
{
    fn send_response(&self, response: ResponseEnvelope) {
        self(response);
    }
}

struct Responder {
    rid: CallId,
    sink: Arc<dyn ResponseSink>,
    answered: AtomicBool,
}

/// An invoke received from the peer.
#[derive(Clone)]
pub struct ProcedureRequest {
    event: String,
    data: Value,
    responder: Arc<Responder>,
}

impl fmt::Debug for ProcedureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureRequest")
            .field("event", &self.event)
            .field("data", &self.data)
            .field("rid", &self.responder.rid)
            .field("answered", &self.is_answered())
            .finish()
    }
}

impl ProcedureRequest {
    /// Wrap an inbound invoke.
    pub fn new(event: String, data: Value, rid: CallId, sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            event,
            data,
            responder: Arc::new(Responder {
                rid,
                sink,
                answered: AtomicBool::new(false),
            }),
        }
    }

    /// Event name.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Payload.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Call id the response will carry as `rid`.
    pub fn call_id(&self) -> CallId {
        self.responder.rid
    }

    /// Whether a response has been sent.
    pub fn is_answered(&self) -> bool {
        self.responder.answered.load(Ordering::Acquire)
    }

    /// Answer with a success payload.
    pub fn end(&self, data: Value) -> Result<(), InvalidActionError> {
        self.claim()?;
        self.responder
            .sink
            .send_response(ResponseEnvelope::ok(self.responder.rid, data));
        Ok(())
    }

    /// Answer with an error.
    pub fn error(&self, error: WireError) -> Result<(), InvalidActionError> {
        self.claim()?;
        self.responder
            .sink
            .send_response(ResponseEnvelope::err(self.responder.rid, &error));
        Ok(())
    }

    fn claim(&self) -> Result<(), InvalidActionError> {
        if self.responder.answered.swap(true, Ordering::AcqRel) {
            return Err(InvalidActionError(format!(
                "response to event {:?} has already been sent",
                self.event
            )));
        }
        Ok(())
    }
}
