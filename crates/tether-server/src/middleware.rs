//! Server-side action interceptors.
//!
//! Every inbound action, and every outbound publication, runs through the
//! interceptors registered for its [`MiddlewareKind`] before it takes effect.
//! Interceptors run strictly in registration order; the first one to return
//! an error stops the chain. An interceptor may rewrite
//! [`ActionRequest::data`], and the action proceeds with whatever value the
//! last interceptor left there.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tether_core::errors::{SilentlyBlockedError, WireError};
use tether_core::ids::SocketId;
use thiserror::Error;
use tracing::debug;

use crate::metrics::MIDDLEWARE_BLOCKS_TOTAL;

/// Which server action an interceptor guards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MiddlewareKind {
    /// A transport connection is being accepted. Sees remote address and
    /// origin only.
    HandshakeTransport,
    /// The client sent `#handshake`.
    HandshakeProtocol,
    /// A signed token verified; the claims are about to be applied.
    Authenticate,
    /// The client asked to join a channel.
    Subscribe,
    /// The client published to a channel.
    PublishIn,
    /// A publication is about to be delivered to one subscriber.
    PublishOut,
    /// The client sent a transmit.
    Transmit,
    /// The client sent an invoke.
    Invoke,
}

impl MiddlewareKind {
    /// Every category, in the order a connection meets them.
    pub const ALL: [Self; 8] = [
        Self::HandshakeTransport,
        Self::HandshakeProtocol,
        Self::Authenticate,
        Self::Subscribe,
        Self::PublishIn,
        Self::PublishOut,
        Self::Transmit,
        Self::Invoke,
    ];

    /// camelCase name, used in logs, metric labels and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeTransport => "handshakeTransport",
            Self::HandshakeProtocol => "handshakeProtocol",
            Self::Authenticate => "authenticate",
            Self::Subscribe => "subscribe",
            Self::PublishIn => "publishIn",
            Self::PublishOut => "publishOut",
            Self::Transmit => "transmit",
            Self::Invoke => "invoke",
        }
    }
}

impl fmt::Display for MiddlewareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The action an interceptor is asked to allow.
///
/// Fields that do not apply to a category are `None` (e.g. `channel` for
/// transmits, `socket_id` during the transport handshake).
#[derive(Clone, Debug, PartialEq)]
pub struct ActionRequest {
    /// Category being run.
    pub kind: MiddlewareKind,
    /// Socket the action belongs to.
    pub socket_id: Option<SocketId>,
    /// Peer address as seen by the listener.
    pub remote_addr: Option<SocketAddr>,
    /// `Origin` header of the upgrade request.
    pub origin: Option<String>,
    /// Event name for transmits and invokes.
    pub event: Option<String>,
    /// Channel for subscribe and publish actions.
    pub channel: Option<String>,
    /// Action payload. Interceptors may replace it.
    pub data: Value,
    /// Verified claims of the socket (or of the token being authenticated).
    pub auth_token: Option<Value>,
    /// Signed form of `auth_token`.
    pub signed_auth_token: Option<String>,
}

impl ActionRequest {
    /// Empty request of `kind`.
    pub fn new(kind: MiddlewareKind) -> Self {
        Self {
            kind,
            socket_id: None,
            remote_addr: None,
            origin: None,
            event: None,
            channel: None,
            data: Value::Null,
            auth_token: None,
            signed_auth_token: None,
        }
    }
}

/// Why an interceptor refused an action.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MiddlewareError {
    /// Error class name sent to the client.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Block without raising a server warning.
    pub silent: bool,
    /// Close code to disconnect with. Only honoured by the handshake
    /// categories.
    pub status_code: Option<u16>,
}

impl MiddlewareError {
    /// Refusal named `MiddlewareError`.
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("MiddlewareError", message)
    }

    /// Refusal with a custom error class name.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            silent: false,
            status_code: None,
        }
    }

    /// Suppress the warning event for this refusal.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Close the connection with `code` (handshake categories only).
    #[must_use]
    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }
}

impl From<&MiddlewareError> for WireError {
    fn from(err: &MiddlewareError) -> Self {
        let wire = Self::new(err.name.clone(), err.message.clone());
        match err.status_code {
            Some(code) => wire.with_data(json!({ "statusCode": code })),
            None => wire,
        }
    }
}

/// An action interceptor.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Unique name within its category.
    fn name(&self) -> &str;

    /// Allow the action (possibly after rewriting `request.data`) or refuse it.
    async fn handle(&self, request: &mut ActionRequest) -> Result<(), MiddlewareError>;
}

/// Interceptor built from an async closure that takes the request and
/// returns the (possibly rewritten) request.
pub struct FnMiddleware<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as a [`Middleware`].
pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn Middleware>
where
    F: Fn(ActionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionRequest, MiddlewareError>> + Send + 'static,
{
    Arc::new(FnMiddleware {
        name: name.into(),
        f,
    })
}

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(ActionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionRequest, MiddlewareError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, request: &mut ActionRequest) -> Result<(), MiddlewareError> {
        *request = (self.f)(request.clone()).await?;
        Ok(())
    }
}

/// Result of running one category's chain. Consumed once by the action it
/// guards.
#[derive(Debug)]
#[must_use]
pub enum PipelineOutcome {
    /// Every interceptor allowed the action.
    Allow(ActionRequest),
    /// An interceptor refused the action.
    Block(MiddlewareError),
    /// An interceptor refused the action and asked for no warning.
    SilentBlock(SilentlyBlockedError),
}

impl PipelineOutcome {
    /// Whether the action may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    /// Error to send back to the client when the action was refused.
    pub fn wire_error(&self) -> Option<WireError> {
        match self {
            Self::Allow(_) => None,
            Self::Block(err) => Some(WireError::from(err)),
            Self::SilentBlock(err) => Some(WireError::from(err)),
        }
    }
}

/// Ordered interceptor chains, one per [`MiddlewareKind`].
///
/// Chains can be edited while sockets are live; a run works on a snapshot
/// of the chain taken when it starts.
#[derive(Default)]
pub struct MiddlewarePipeline {
    chains: RwLock<HashMap<MiddlewareKind, Vec<Arc<dyn Middleware>>>>,
}

impl MiddlewarePipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `middleware` to the `kind` chain. An interceptor with the same
    /// name is replaced in place.
    pub fn add(&self, kind: MiddlewareKind, middleware: Arc<dyn Middleware>) {
        let mut chains = self.chains.write();
        let chain = chains.entry(kind).or_default();
        debug!(kind = %kind, name = middleware.name(), "registering middleware");
        match chain.iter().position(|m| m.name() == middleware.name()) {
            Some(pos) => chain[pos] = middleware,
            None => chain.push(middleware),
        }
    }

    /// Remove the interceptor `name` from the `kind` chain.
    pub fn remove(&self, kind: MiddlewareKind, name: &str) -> bool {
        let mut chains = self.chains.write();
        let Some(chain) = chains.get_mut(&kind) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|m| m.name() != name);
        chain.len() < before
    }

    /// Names in the `kind` chain, in run order.
    pub fn names(&self, kind: MiddlewareKind) -> Vec<String> {
        self.chains
            .read()
            .get(&kind)
            .map(|chain| chain.iter().map(|m| m.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Whether the `kind` chain is empty.
    pub fn is_empty(&self, kind: MiddlewareKind) -> bool {
        self.chains.read().get(&kind).is_none_or(Vec::is_empty)
    }

    /// Total number of interceptors.
    pub fn count(&self) -> usize {
        self.chains.read().values().map(Vec::len).sum()
    }

    /// Run `request` through its category's chain.
    pub async fn run(&self, mut request: ActionRequest) -> PipelineOutcome {
        let kind = request.kind;
        let chain = self.chains.read().get(&kind).cloned().unwrap_or_default();
        for middleware in chain {
            if let Err(err) = middleware.handle(&mut request).await {
                counter!(MIDDLEWARE_BLOCKS_TOTAL, "kind" => kind.as_str()).increment(1);
                debug!(
                    kind = %kind,
                    middleware = middleware.name(),
                    silent = err.silent,
                    error = %err,
                    "action blocked"
                );
                if err.silent {
                    return PipelineOutcome::SilentBlock(SilentlyBlockedError {
                        action: kind.as_str().to_string(),
                    });
                }
                return PipelineOutcome::Block(err);
            }
        }
        PipelineOutcome::Allow(request)
    }
}

impl fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("middleware_count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, _request: &mut ActionRequest) -> Result<(), MiddlewareError> {
            self.log.lock().push(self.name.clone());
            Ok(())
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(Recorder {
            name: name.into(),
            log: Arc::clone(log),
        })
    }

    fn transmit(data: Value) -> ActionRequest {
        ActionRequest {
            event: Some("chat".into()),
            data,
            ..ActionRequest::new(MiddlewareKind::Transmit)
        }
    }

    #[tokio::test]
    async fn empty_chain_allows() {
        let pipeline = MiddlewarePipeline::new();
        let outcome = pipeline.run(transmit(json!(1))).await;
        assert_matches!(outcome, PipelineOutcome::Allow(req) if req.data == json!(1));
    }

    #[tokio::test]
    async fn runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new();
        pipeline.add(MiddlewareKind::Transmit, recorder("a", &log));
        pipeline.add(MiddlewareKind::Transmit, recorder("b", &log));
        pipeline.add(MiddlewareKind::Invoke, recorder("other", &log));

        assert!(pipeline.run(transmit(Value::Null)).await.is_allowed());
        assert_eq!(*log.lock(), ["a", "b"]);
    }

    #[tokio::test]
    async fn first_failure_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new();
        pipeline.add(
            MiddlewareKind::Transmit,
            from_fn("deny", |_req| async { Err(MiddlewareError::new("nope")) }),
        );
        pipeline.add(MiddlewareKind::Transmit, recorder("after", &log));

        let outcome = pipeline.run(transmit(Value::Null)).await;
        assert_matches!(&outcome, PipelineOutcome::Block(err) if err.message == "nope");
        assert_eq!(outcome.wire_error().unwrap().name, "MiddlewareError");
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn silent_failure_is_reported_as_silent_block() {
        let pipeline = MiddlewarePipeline::new();
        pipeline.add(
            MiddlewareKind::Subscribe,
            from_fn("quiet", |_req| async {
                Err(MiddlewareError::new("hidden").silent())
            }),
        );
        let outcome = pipeline
            .run(ActionRequest::new(MiddlewareKind::Subscribe))
            .await;
        assert_matches!(
            &outcome,
            PipelineOutcome::SilentBlock(err) if err.action == "subscribe"
        );
        assert_eq!(
            outcome.wire_error().unwrap().name,
            "SilentMiddlewareBlockedError"
        );
    }

    #[tokio::test]
    async fn interceptors_rewrite_data_in_sequence() {
        let pipeline = MiddlewarePipeline::new();
        pipeline.add(
            MiddlewareKind::Transmit,
            from_fn("double", |mut req: ActionRequest| async move {
                req.data = json!(req.data.as_i64().unwrap_or(0) * 2);
                Ok(req)
            }),
        );
        pipeline.add(
            MiddlewareKind::Transmit,
            from_fn("increment", |mut req: ActionRequest| async move {
                req.data = json!(req.data.as_i64().unwrap_or(0) + 1);
                Ok(req)
            }),
        );
        let outcome = pipeline.run(transmit(json!(5))).await;
        assert_matches!(outcome, PipelineOutcome::Allow(req) if req.data == json!(11));
    }

    #[test]
    fn same_name_replaces_in_place() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new();
        pipeline.add(MiddlewareKind::Invoke, recorder("a", &log));
        pipeline.add(MiddlewareKind::Invoke, recorder("b", &log));
        pipeline.add(MiddlewareKind::Invoke, recorder("a", &log));
        assert_eq!(pipeline.names(MiddlewareKind::Invoke), ["a", "b"]);
        assert_eq!(pipeline.count(), 2);
    }

    #[test]
    fn remove_by_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new();
        pipeline.add(MiddlewareKind::Invoke, recorder("a", &log));
        assert!(pipeline.remove(MiddlewareKind::Invoke, "a"));
        assert!(!pipeline.remove(MiddlewareKind::Invoke, "a"));
        assert!(!pipeline.remove(MiddlewareKind::Transmit, "a"));
        assert!(pipeline.is_empty(MiddlewareKind::Invoke));
    }

    #[test]
    fn status_code_travels_in_wire_data() {
        let err = MiddlewareError::named("Banned", "go away").with_status(4555);
        let wire = WireError::from(&err);
        assert_eq!(wire.name, "Banned");
        assert_eq!(wire.data, Some(json!({"statusCode": 4555})));
    }

    #[test]
    fn kind_names_are_unique() {
        let mut names: Vec<_> = MiddlewareKind::ALL.iter().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), MiddlewareKind::ALL.len());
    }
}
