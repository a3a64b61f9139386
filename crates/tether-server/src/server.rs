//! `Server`: socket registry, broker fan-out and the axum HTTP surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tether_auth::{AuthEngine, JwtAuthEngine, generate_key};
use tether_core::close_codes;
use tether_core::codec::{Codec, JsonCodec};
use tether_core::errors::{BrokerError, WireError};
use tether_core::ids::SocketId;
use tether_core::link::Link;
use tether_core::state::AuthState;
use tether_core::stream::{MultiplexedStream, Reader};
use tether_settings::ServerSettings;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{Broker, BrokerPublication, MemoryBroker};
use crate::events::{ServerEvent, ServerEventKind};
use crate::health::{self, HealthResponse};
use crate::metrics::{self as server_metrics, BROKER_LAGGED_TOTAL, PUBLISHES_TOTAL, WS_REJECTIONS_TOTAL};
use crate::middleware::{ActionRequest, MiddlewareError, MiddlewareKind, MiddlewarePipeline, PipelineOutcome};
use crate::shutdown::ShutdownCoordinator;
use crate::socket::{HandshakeInfo, ServerSocket};
use crate::ws;

/// State shared by the server and every socket it owns.
pub(crate) struct ServerInner {
    pub(crate) settings: ServerSettings,
    pub(crate) middleware: MiddlewarePipeline,
    pub(crate) auth: Arc<dyn AuthEngine>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) sockets: RwLock<HashMap<SocketId, ServerSocket>>,
    pub(crate) shutdown: ShutdownCoordinator,
    listeners: MultiplexedStream<ServerEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl ServerInner {
    pub(crate) fn notify(&self, kind: ServerEventKind) {
        let event = ServerEvent::now(kind);
        self.listeners.write(event.name(), event);
    }

    pub(crate) fn warn(&self, socket_id: Option<&SocketId>, error: WireError) {
        warn!(socket_id = ?socket_id.map(SocketId::as_str), error = %error, "server warning");
        self.notify(ServerEventKind::Warning {
            socket_id: socket_id.cloned(),
            error,
        });
    }

    /// Warning for a middleware refusal, when the server is configured to
    /// raise them.
    pub(crate) fn middleware_warning(&self, socket_id: Option<&SocketId>, err: &MiddlewareError) {
        if self.settings.middleware_emit_warnings {
            self.warn(socket_id, WireError::from(err));
        }
    }

    /// Keep `handle` for graceful shutdown, dropping finished ones.
    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    pub(crate) async fn publish(&self, channel: &str, data: Value) -> Result<(), BrokerError> {
        self.broker.publish(channel, data).await?;
        counter!(PUBLISHES_TOTAL).increment(1);
        Ok(())
    }

    fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let allowed = &self.settings.allowed_origins;
        if allowed.is_empty() || allowed.iter().any(|o| o == "*") {
            return true;
        }
        // Non-browser clients send no Origin header.
        origin.is_none_or(|origin| allowed.iter().any(|o| o == origin))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Assembles a [`Server`] from settings and optional collaborators.
pub struct ServerBuilder {
    settings: ServerSettings,
    auth: Option<Arc<dyn AuthEngine>>,
    broker: Option<Arc<dyn Broker>>,
    codec: Option<Arc<dyn Codec>>,
    metrics: Option<PrometheusHandle>,
}

impl ServerBuilder {
    /// Builder with the default collaborators.
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            auth: None,
            broker: None,
            codec: None,
            metrics: None,
        }
    }

    /// Token engine. Defaults to HS256 JWTs keyed by `auth_key`, or by a
    /// random key when none is configured.
    #[must_use]
    pub fn auth_engine(mut self, auth: Arc<dyn AuthEngine>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Pub/sub backend. Defaults to a [`MemoryBroker`].
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Wire codec. Defaults to [`JsonCodec`].
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Handle `/metrics` renders from.
    #[must_use]
    pub fn metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the server and start its broker fan-out task. Must be called
    /// inside a tokio runtime.
    pub fn build(self) -> Server {
        let settings = self.settings;
        let auth = self.auth.unwrap_or_else(|| {
            let key = settings.auth_key.clone().unwrap_or_else(generate_key);
            Arc::new(
                JwtAuthEngine::new(key.as_bytes())
                    .with_default_expiry(Duration::from_secs(settings.auth_default_expiry_secs)),
            )
        });
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(MemoryBroker::new(settings.broker_capacity)));
        let codec = self.codec.unwrap_or_else(|| Arc::new(JsonCodec));
        let feed = broker.publications();

        let inner = Arc::new(ServerInner {
            settings,
            middleware: MiddlewarePipeline::new(),
            auth,
            broker,
            codec,
            sockets: RwLock::new(HashMap::new()),
            shutdown: ShutdownCoordinator::new(),
            listeners: MultiplexedStream::new(),
            tasks: Mutex::new(Vec::new()),
            start_time: Instant::now(),
            metrics: self.metrics,
        });
        let cancel = inner.shutdown.token();
        inner.track(tokio::spawn(fan_out(Arc::downgrade(&inner), feed, cancel)));
        Server { inner }
    }
}

/// Route broker publications to subscribed sockets.
async fn fan_out(
    server: Weak<ServerInner>,
    mut feed: tokio::sync::broadcast::Receiver<BrokerPublication>,
    cancel: CancellationToken,
) {
    loop {
        let publication = tokio::select! {
            () = cancel.cancelled() => break,
            received = feed.recv() => match received {
                Ok(publication) => publication,
                Err(RecvError::Lagged(skipped)) => {
                    counter!(BROKER_LAGGED_TOTAL).increment(skipped);
                    warn!(skipped, "fan-out fell behind the broker");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        let Some(inner) = server.upgrade() else {
            break;
        };
        let recipients = inner.broker.subscribers(&publication.channel).await;
        debug!(
            channel = %publication.channel,
            recipients = recipients.len(),
            "fan-out publication"
        );
        for id in recipients {
            let socket = inner.sockets.read().get(&id).cloned();
            if let Some(socket) = socket {
                socket.deliver(&publication).await;
            }
        }
    }
    debug!("fan-out stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The server the routes belong to.
    pub server: Server,
}

/// The tether server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("clients", &self.clients_count())
            .field("middleware", &self.inner.middleware)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Server with default collaborators. Must be called inside a tokio
    /// runtime.
    pub fn new(settings: ServerSettings) -> Self {
        ServerBuilder::new(settings).build()
    }

    /// Start building a server.
    pub fn builder(settings: ServerSettings) -> ServerBuilder {
        ServerBuilder::new(settings)
    }

    /// Settings the server was built with.
    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    /// Interceptor chains.
    pub fn middleware(&self) -> &MiddlewarePipeline {
        &self.inner.middleware
    }

    /// Token engine, for signing tokens outside a socket.
    pub fn auth_engine(&self) -> &Arc<dyn AuthEngine> {
        &self.inner.auth
    }

    /// Pub/sub backend.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.inner.shutdown
    }

    /// Notifications named `name` (see [`ServerEvent::name`]).
    pub fn listener(&self, name: &str) -> Reader<ServerEvent> {
        self.inner.listeners.reader(name)
    }

    /// Open socket by id.
    pub fn socket(&self, id: &SocketId) -> Option<ServerSocket> {
        self.inner.sockets.read().get(id).cloned()
    }

    /// Every open socket.
    pub fn sockets(&self) -> Vec<ServerSocket> {
        self.inner.sockets.read().values().cloned().collect()
    }

    /// Number of open sockets.
    pub fn clients_count(&self) -> usize {
        self.inner.sockets.read().len()
    }

    /// Number of open sockets holding a verified token.
    pub fn authenticated_count(&self) -> usize {
        self.inner
            .sockets
            .read()
            .values()
            .filter(|s| s.auth_state() == AuthState::Authenticated)
            .count()
    }

    /// Publish to `channel` from the server. Skips publish-in middleware;
    /// publish-out middleware still runs per recipient.
    pub async fn publish(&self, channel: &str, data: Value) -> Result<(), BrokerError> {
        self.inner.publish(channel, data).await
    }

    /// Adopt an accepted transport link.
    ///
    /// Checks the origin allow-list and runs handshake-transport middleware;
    /// a refusal closes the link (4003 unless the middleware names a code)
    /// and returns `None`.
    #[instrument(skip_all, fields(remote = ?info.remote_addr))]
    pub async fn accept(&self, link: Link, info: HandshakeInfo) -> Option<ServerSocket> {
        let Link { sender, receiver } = link;
        let inner = &self.inner;
        if inner.shutdown.is_shutting_down() {
            sender.close(close_codes::GOING_AWAY, "Server is shutting down");
            counter!(WS_REJECTIONS_TOTAL, "reason" => "shutdown").increment(1);
            return None;
        }
        if !inner.origin_allowed(info.origin.as_deref()) {
            let message = format!("origin {:?} is not allowed", info.origin);
            inner.warn(None, WireError::new("OriginError", message));
            sender.close(close_codes::HANDSHAKE_TRANSPORT_FAILURE, "Origin not allowed");
            counter!(WS_REJECTIONS_TOTAL, "reason" => "origin").increment(1);
            return None;
        }

        let request = ActionRequest {
            remote_addr: info.remote_addr,
            origin: info.origin.clone(),
            ..ActionRequest::new(MiddlewareKind::HandshakeTransport)
        };
        let refusal = match inner.middleware.run(request).await {
            PipelineOutcome::Allow(_) => None,
            PipelineOutcome::Block(err) => {
                inner.middleware_warning(None, &err);
                let code = err
                    .status_code
                    .unwrap_or(close_codes::HANDSHAKE_TRANSPORT_FAILURE);
                Some((code, err.message))
            }
            PipelineOutcome::SilentBlock(err) => {
                Some((close_codes::HANDSHAKE_TRANSPORT_FAILURE, err.to_string()))
            }
        };
        if let Some((code, reason)) = refusal {
            debug!(code, %reason, "transport handshake refused");
            sender.close(code, &reason);
            counter!(WS_REJECTIONS_TOTAL, "reason" => "middleware").increment(1);
            return None;
        }

        Some(ServerSocket::spawn(
            Arc::clone(inner),
            sender,
            receiver,
            info,
        ))
    }

    /// Build the axum router: `/health`, `/metrics` and the WebSocket path.
    pub fn router(&self) -> Router {
        let state = AppState {
            server: self.clone(),
        };
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(&self.inner.settings.path, get(ws::ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind `host:port` and serve the router until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let settings = &self.inner.settings;
        let listener =
            tokio::net::TcpListener::bind((settings.host.as_str(), settings.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.inner.shutdown.token();
        let handle = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server stopped with an error");
            }
        });
        info!(%addr, path = %settings.path, "listening");
        Ok((addr, handle))
    }

    /// Stop accepting, close every socket with 1001, then wait (up to
    /// `shutdown_timeout_ms`) for socket loops, the fan-out task and
    /// `listener` to finish.
    pub async fn close(&self, listener: Option<JoinHandle<()>>) {
        info!(clients = self.clients_count(), "closing server");
        self.inner.shutdown.shutdown();
        for socket in self.sockets() {
            socket.disconnect(close_codes::GOING_AWAY, "Server is shutting down");
        }
        let mut handles = std::mem::take(&mut *self.inner.tasks.lock());
        handles.extend(listener);
        let timeout = Duration::from_millis(self.inner.settings.shutdown_timeout_ms);
        self.inner
            .shutdown
            .graceful_shutdown(handles, Some(timeout))
            .await;
    }

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        self.inner.track(handle);
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let server = &state.server;
    Json(health::health_check(
        server.inner.start_time,
        server.clients_count(),
        server.authenticated_count(),
        server.shutdown().is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.server.inner.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            server_metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
