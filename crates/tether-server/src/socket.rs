//! Server end of one connection.
//!
//! A [`ServerSocket`] is created when the transport handshake is accepted
//! and lives until its link closes. Inbound frames are processed one at a
//! time by the socket's own task, so middleware for one socket runs strictly
//! in arrival order; separate sockets never share state.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tether_auth::{SignOptions, decode_unverified};
use tether_core::close_codes;
use tether_core::codec::{InboundFrame, PING, PONG, decode_frame};
use tether_core::correlator::{CallCorrelator, spawn_timer};
use tether_core::envelope::{
    Action, AuthStatus, Envelope, EventEnvelope, HandshakeRequest, HandshakeResponse, KickOut,
    Publication, ResponseEnvelope, SetAuthToken, SubscribeRequest, check_channel_name,
    check_event_name, parse_packet, reserved,
};
use tether_core::errors::{
    AuthTokenError, BadConnectionError, CallError, ConnectionLossKind, InvalidActionError,
    ProtocolError, SocketProtocolError, WireError,
};
use tether_core::ids::{CallId, SocketId};
use tether_core::keepalive::{Activity, DeadlineResult, watch_deadline};
use tether_core::link::{Frame, LinkSender};
use tether_core::procedure::{ProcedureRequest, ResponseSink};
use tether_core::state::{AuthState, ConnectionState};
use tether_core::stream::{MultiplexedStream, Reader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::BrokerPublication;
use crate::events::{ServerEventKind, SocketEvent};
use crate::metrics::{
    PUBLICATIONS_DELIVERED_TOTAL, SUBSCRIPTIONS_ACTIVE, WS_CONNECTION_DURATION_SECONDS,
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::middleware::{ActionRequest, MiddlewareKind, PipelineOutcome};
use crate::server::ServerInner;

/// What the transport layer knows about a connection before it becomes a
/// socket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Peer address.
    pub remote_addr: Option<SocketAddr>,
    /// `Origin` header of the upgrade request.
    pub origin: Option<String>,
}

struct SocketState {
    connection: ConnectionState,
    auth: AuthState,
    token: Option<Value>,
    signed_token: Option<String>,
    correlator: CallCorrelator,
    channels: BTreeSet<String>,
    handshake_timer: Option<AbortHandle>,
}

struct SocketInner {
    id: SocketId,
    info: HandshakeInfo,
    server: Arc<ServerInner>,
    link: LinkSender,
    cancel: CancellationToken,
    activity: Arc<Activity>,
    opened_at: Instant,
    state: Mutex<SocketState>,
    listeners: MultiplexedStream<SocketEvent>,
    receivers: MultiplexedStream<Value>,
    procedures: MultiplexedStream<ProcedureRequest>,
}

/// Handle to one connected peer. Cloning yields another handle to the same
/// socket.
#[derive(Clone)]
pub struct ServerSocket {
    inner: Arc<SocketInner>,
}

impl std::fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSocket")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("auth", &self.auth_state())
            .finish_non_exhaustive()
    }
}

impl ServerSocket {
    /// Register a socket for an accepted link and start its tasks.
    pub(crate) fn spawn(
        server: Arc<ServerInner>,
        link: LinkSender,
        receiver: UnboundedReceiver<Frame>,
        info: HandshakeInfo,
    ) -> Self {
        let cancel = server.shutdown.token().child_token();
        let socket = Self {
            inner: Arc::new(SocketInner {
                id: SocketId::new(),
                info,
                server: Arc::clone(&server),
                link,
                cancel,
                activity: Arc::new(Activity::new()),
                opened_at: Instant::now(),
                state: Mutex::new(SocketState {
                    connection: ConnectionState::Connecting,
                    auth: AuthState::Unauthenticated,
                    token: None,
                    signed_token: None,
                    correlator: CallCorrelator::new(),
                    channels: BTreeSet::new(),
                    handshake_timer: None,
                }),
                listeners: MultiplexedStream::new(),
                receivers: MultiplexedStream::new(),
                procedures: MultiplexedStream::new(),
            }),
        };
        let id = socket.id().clone();
        let _ = server.sockets.write().insert(id.clone(), socket.clone());
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!(socket_id = %id, remote = ?socket.remote_addr(), "socket accepted");
        server.notify(ServerEventKind::Handshake { socket_id: id });

        let weak = Arc::downgrade(&socket.inner);
        let timeout = Duration::from_millis(server.settings.handshake_timeout_ms);
        let timer = spawn_timer(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.on_handshake_timeout();
            }
        });
        socket.inner.state.lock().handshake_timer = Some(timer);

        socket.start_keepalive();
        server.track(tokio::spawn(socket.clone().run(receiver)));
        socket
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    /// Server-assigned id.
    pub fn id(&self) -> &SocketId {
        &self.inner.id
    }

    /// Peer address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.info.remote_addr
    }

    /// `Origin` header of the upgrade request.
    pub fn origin(&self) -> Option<&str> {
        self.inner.info.origin.as_deref()
    }

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    /// Auth state.
    pub fn auth_state(&self) -> AuthState {
        self.inner.state.lock().auth
    }

    /// Verified claims.
    pub fn auth_token(&self) -> Option<Value> {
        self.inner.state.lock().token.clone()
    }

    /// Signed token the claims came from.
    pub fn signed_auth_token(&self) -> Option<String> {
        self.inner.state.lock().signed_token.clone()
    }

    /// Channels this socket belongs to, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.state.lock().channels.iter().cloned().collect()
    }

    /// Whether this socket belongs to `channel`.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner.state.lock().channels.contains(channel)
    }

    /// Invokes sent to the peer that are still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.state.lock().correlator.len()
    }

    /// Notifications named `name` (see [`SocketEvent::name`]).
    pub fn listener(&self, name: &str) -> Reader<SocketEvent> {
        self.inner.listeners.reader(name)
    }

    /// Payloads of transmits named `event` that passed middleware.
    pub fn receiver(&self, event: &str) -> Reader<Value> {
        self.inner.receivers.reader(event)
    }

    /// Invokes named `event` that passed middleware, to be answered with
    /// [`ProcedureRequest::end`] or [`ProcedureRequest::error`].
    pub fn procedure(&self, event: &str) -> Reader<ProcedureRequest> {
        self.inner.procedures.reader(event)
    }

    // ── Outbound ────────────────────────────────────────────────────────────

    /// Send a one-way event.
    pub fn transmit(&self, event: &str, data: Value) -> Result<(), CallError> {
        check_event_name(event)?;
        self.send_event(EventEnvelope::new(event, data))
    }

    /// Send an event and wait for the peer's answer, up to the configured
    /// ack timeout.
    pub async fn invoke(&self, event: &str, data: Value) -> Result<Value, CallError> {
        let timeout = Duration::from_millis(self.inner.server.settings.ack_timeout_ms);
        self.invoke_with_timeout(event, data, Some(timeout)).await
    }

    /// [`invoke`](Self::invoke) with an explicit timeout; `None` waits until
    /// the connection closes.
    pub async fn invoke_with_timeout(
        &self,
        event: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        check_event_name(event)?;
        let rx = {
            let mut state = self.inner.state.lock();
            if state.connection == ConnectionState::Closed {
                return Err(bad_connection(event));
            }
            let (cid, rx) = state.correlator.register(event);
            if let Some(timeout) = timeout {
                let weak = Arc::downgrade(&self.inner);
                let timer = spawn_timer(timeout, move || {
                    if let Some(inner) = weak.upgrade() {
                        let _ = inner.state.lock().correlator.expire(cid);
                    }
                });
                state.correlator.attach_timer(cid, timer);
            }
            let packet = Envelope::Event(EventEnvelope::new(event, data).with_cid(cid));
            if let Err(e) = self.write_packet(&packet.to_value()) {
                let _ = state.correlator.cancel(cid);
                return Err(e);
            }
            rx
        };
        rx.await.unwrap_or_else(|_| Err(bad_connection(event)))
    }

    // ── Auth ────────────────────────────────────────────────────────────────

    /// Sign `claims`, apply them to this socket and send the token to the
    /// client. A signing failure closes the socket with 4002.
    pub async fn set_auth_token(&self, claims: Value) -> Result<String, AuthTokenError> {
        self.set_auth_token_with(claims, &SignOptions::default())
            .await
    }

    /// [`set_auth_token`](Self::set_auth_token) with explicit sign options.
    #[instrument(skip_all, fields(socket_id = %self.inner.id))]
    pub async fn set_auth_token_with(
        &self,
        claims: Value,
        options: &SignOptions,
    ) -> Result<String, AuthTokenError> {
        if self.state() == ConnectionState::Closed {
            return Err(AuthTokenError::Other("socket is closed".into()));
        }
        let signed = match self.inner.server.auth.sign(&claims, options).await {
            Ok(signed) => signed,
            Err(e) => {
                warn!(error = %e, "failed to sign auth token");
                self.emit(SocketEvent::Error {
                    error: WireError::from(&e),
                });
                let code = close_codes::TOKEN_SIGN_FAILURE;
                self.disconnect(code, close_codes::describe(code));
                return Err(e);
            }
        };
        let applied = decode_unverified(&signed).unwrap_or(claims);
        self.apply_token(applied, signed.clone());
        let payload = serde_json::to_value(SetAuthToken {
            token: signed.clone(),
        })
        .unwrap_or(Value::Null);
        if let Err(e) = self.send_event(EventEnvelope::new(reserved::SET_AUTH_TOKEN, payload)) {
            debug!(error = %e, "could not deliver new auth token");
        }
        Ok(signed)
    }

    /// Drop this socket's token and tell the client to remove its copy.
    pub fn deauthenticate(&self) {
        let _ = self.deauthenticate_self();
        if let Err(e) = self.send_event(EventEnvelope::new(reserved::REMOVE_AUTH_TOKEN, Value::Null))
        {
            debug!(error = %e, "could not deliver token removal");
        }
    }

    // ── Channels ────────────────────────────────────────────────────────────

    /// Remove this socket from `channel` and notify the client. Returns
    /// `false` when it was not subscribed.
    pub async fn kick_out(&self, channel: &str, message: Option<&str>) -> bool {
        if !self.leave_channel(channel).await {
            return false;
        }
        let payload = serde_json::to_value(KickOut {
            channel: channel.to_string(),
            message: message.map(str::to_string),
        })
        .unwrap_or(Value::Null);
        if let Err(e) = self.send_event(EventEnvelope::new(reserved::KICK_OUT, payload)) {
            debug!(error = %e, "could not deliver kick-out");
        }
        true
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Close the link with `code` and run the close sequence.
    pub fn disconnect(&self, code: u16, reason: &str) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.inner.link.close(code, reason);
        self.on_close(code, reason);
    }

    #[instrument(skip_all, fields(socket_id = %self.inner.id))]
    async fn run(self, mut receiver: UnboundedReceiver<Frame>) {
        loop {
            let frame = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                frame = receiver.recv() => frame,
            };
            match frame {
                Some(Frame::Text(text)) => {
                    self.inner.activity.touch();
                    self.on_text(&text).await;
                }
                Some(Frame::Close { code, reason }) => {
                    debug!(code, %reason, "peer closed");
                    self.on_close(code, &reason);
                    break;
                }
                None => {
                    self.on_close(close_codes::ABNORMAL, "");
                    break;
                }
            }
        }
        // Still open only when the server cancelled the loop.
        self.disconnect(close_codes::GOING_AWAY, "Server is shutting down");
    }

    fn start_keepalive(&self) {
        let settings = &self.inner.server.settings;
        let every = Duration::from_millis(settings.ping_interval_ms.max(1));
        let link = self.inner.link.clone();
        let cancel = self.inner.cancel.clone();
        let _pinger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // Skip the immediate first tick
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if link.send_text(PING.to_string()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        if settings.ping_timeout_disabled {
            return;
        }
        let timeout = Duration::from_millis(settings.ping_timeout_ms);
        let weak = Arc::downgrade(&self.inner);
        let activity = Arc::clone(&self.inner.activity);
        let cancel = self.inner.cancel.clone();
        let _watchdog = tokio::spawn(async move {
            if watch_deadline(&activity, timeout, &cancel).await != DeadlineResult::TimedOut {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                let socket = Self { inner };
                warn!(socket_id = %socket.id(), "client stopped answering pings");
                let code = close_codes::PONG_TIMEOUT;
                socket.disconnect(code, close_codes::describe(code));
            }
        });
    }

    fn on_handshake_timeout(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.connection != ConnectionState::Connecting {
                return;
            }
            state.handshake_timer = None;
        }
        warn!(socket_id = %self.id(), "handshake timed out");
        let code = close_codes::HANDSHAKE_TIMEOUT;
        self.disconnect(code, close_codes::describe(code));
    }

    /// Mark closed, notify, reject outstanding calls, leave every channel
    /// and unregister from the server.
    fn on_close(&self, code: u16, reason: &str) {
        let reason = if reason.is_empty() {
            close_codes::describe(code).to_string()
        } else {
            reason.to_string()
        };
        let (was, channels) = {
            let mut state = self.inner.state.lock();
            if state.connection == ConnectionState::Closed {
                return;
            }
            let was = state.connection;
            state.connection = ConnectionState::Closed;
            if let Some(timer) = state.handshake_timer.take() {
                timer.abort();
            }
            (was, std::mem::take(&mut state.channels))
        };
        self.inner.cancel.cancel();

        let server = &self.inner.server;
        let id = self.id().clone();
        info!(socket_id = %id, code, %reason, "socket closed");

        if !close_codes::is_ignored(code) {
            let error = SocketProtocolError {
                code,
                message: reason.clone(),
            };
            self.emit(SocketEvent::Error {
                error: WireError::from(&error),
            });
        }
        let kind = if was == ConnectionState::Open {
            self.emit(SocketEvent::Disconnect {
                code,
                reason: reason.clone(),
            });
            server.notify(ServerEventKind::Disconnection {
                socket_id: id.clone(),
                code,
                reason: reason.clone(),
            });
            ConnectionLossKind::Disconnect
        } else {
            self.emit(SocketEvent::ConnectAbort {
                code,
                reason: reason.clone(),
            });
            server.notify(ServerEventKind::ConnectionAbort {
                socket_id: id.clone(),
                code,
                reason: reason.clone(),
            });
            ConnectionLossKind::ConnectAbort
        };
        let _ = self.inner.state.lock().correlator.abort_all(kind);

        for channel in &channels {
            self.channel_left(channel);
        }
        if !channels.is_empty() {
            self.release_channels(channels);
        }

        let _ = server.sockets.write().remove(&id);
        self.emit(SocketEvent::Close {
            code,
            reason: reason.clone(),
        });
        server.notify(ServerEventKind::Closure {
            socket_id: id,
            code,
            reason,
        });

        counter!(WS_DISCONNECTIONS_TOTAL, "code" => code.to_string()).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS)
            .record(self.inner.opened_at.elapsed().as_secs_f64());

        self.inner.listeners.close_all();
        self.inner.receivers.close_all();
        self.inner.procedures.close_all();
    }

    fn release_channels(&self, channels: BTreeSet<String>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(socket_id = %self.id(), "no runtime to release broker channels");
            return;
        };
        let broker = Arc::clone(&self.inner.server.broker);
        let id = self.id().clone();
        let _cleanup = runtime.spawn(async move {
            for channel in channels {
                if let Err(e) = broker.unsubscribe(&id, &channel).await {
                    warn!(socket_id = %id, channel, error = %e, "broker unsubscribe failed");
                }
            }
        });
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    async fn on_text(&self, text: &str) {
        let frame = match decode_frame(self.inner.server.codec.as_ref(), text) {
            Ok(frame) => frame,
            Err(e) => {
                self.warning(WireError::from(&ProtocolError::MalformedEnvelope(
                    e.to_string(),
                )));
                return;
            }
        };
        match frame {
            InboundFrame::Ping => {
                let _ = self.inner.link.send_text(PONG.to_string());
            }
            InboundFrame::Pong => {}
            InboundFrame::Packet(packet) => {
                for envelope in parse_packet(packet) {
                    match envelope {
                        Ok(Envelope::Response(response)) => {
                            let rid = response.rid;
                            if !self.inner.state.lock().correlator.resolve(response) {
                                debug!(%rid, "response for unknown call");
                            }
                        }
                        Ok(Envelope::Event(event)) => self.on_event(event).await,
                        Err(e) => self.warning(WireError::from(&e)),
                    }
                }
            }
        }
    }

    async fn on_event(&self, envelope: EventEnvelope) {
        let EventEnvelope { event, data, cid } = envelope;
        let action = match Action::parse(event, data) {
            Ok(action) => action,
            Err(e) => {
                let error = WireError::from(&e);
                if let Some(rid) = cid {
                    self.respond(ResponseEnvelope::err(rid, &error));
                }
                self.warning(error);
                return;
            }
        };
        let open = self.state() == ConnectionState::Open;
        match action {
            Action::Handshake(request) if !open => self.on_handshake(request, cid).await,
            Action::Handshake(_) => {
                let error = InvalidActionError("the handshake has already completed".into());
                self.answer(cid, Err(WireError::from(&error)));
            }
            other if !open => {
                let error =
                    InvalidActionError(format!("cannot process {} before the handshake", other.name()));
                self.answer(cid, Err(WireError::from(&error)));
            }
            Action::Authenticate(token) => {
                let error = self.process_token(&token).await.err();
                let status = AuthStatus {
                    is_authenticated: error.is_none(),
                    auth_error: error,
                };
                self.answer(cid, Ok(serde_json::to_value(status).unwrap_or(Value::Null)));
            }
            Action::RemoveAuthToken => {
                let _ = self.deauthenticate_self();
            }
            Action::Subscribe(request) => {
                let result = self.subscribe_checked(request).await;
                self.answer(cid, result.map(|()| Value::Null));
            }
            Action::Unsubscribe(channel) => {
                let _ = self.leave_channel(&channel).await;
                self.answer(cid, Ok(Value::Null));
            }
            Action::Publish(publication) => {
                let result = self.publish_checked(publication).await;
                self.answer(cid, result.map(|()| Value::Null));
            }
            server_only @ (Action::SetAuthToken(_) | Action::KickOut(_)) => {
                let error = WireError::from(&ProtocolError::UnexpectedAction(
                    server_only.name().to_string(),
                ));
                self.answer(cid, Err(error));
            }
            Action::Event { event, data } => self.on_app_event(event, data, cid).await,
        }
    }

    #[instrument(skip_all, fields(socket_id = %self.inner.id))]
    async fn on_handshake(&self, request: HandshakeRequest, cid: Option<CallId>) {
        let Some(rid) = cid else {
            self.warning(WireError::from(&ProtocolError::invalid_payload(
                reserved::HANDSHAKE,
                "handshake must expect a response",
            )));
            return;
        };
        let server = &self.inner.server;
        let mut action = self.action_request(MiddlewareKind::HandshakeProtocol);
        action.data = serde_json::to_value(&request).unwrap_or(Value::Null);
        let outcome = server.middleware.run(action).await;
        if let Some(error) = outcome.wire_error() {
            let code = match &outcome {
                PipelineOutcome::Block(err) => {
                    server.middleware_warning(Some(self.id()), err);
                    err.status_code.unwrap_or(close_codes::HANDSHAKE_REJECTED)
                }
                _ => close_codes::HANDSHAKE_REJECTED,
            };
            let error = if error.data.is_some() {
                error
            } else {
                error.with_data(json!({ "statusCode": code }))
            };
            self.respond(ResponseEnvelope::err(rid, &error));
            self.disconnect(code, &error.message);
            return;
        }

        let auth_error = match &request.auth_token {
            Some(token) => self.process_token(token).await.err(),
            None => None,
        };
        {
            let mut state = self.inner.state.lock();
            if state.connection != ConnectionState::Connecting {
                return;
            }
            if let Some(timer) = state.handshake_timer.take() {
                timer.abort();
            }
            state.connection = ConnectionState::Open;
        }
        let is_authenticated = self.auth_state() == AuthState::Authenticated;
        let response = HandshakeResponse {
            id: self.id().clone(),
            ping_timeout: server.settings.ping_timeout_ms,
            is_authenticated,
            auth_error,
        };
        self.respond(ResponseEnvelope::ok(
            rid,
            serde_json::to_value(response).unwrap_or(Value::Null),
        ));
        info!(is_authenticated, "handshake complete");
        self.emit(SocketEvent::Connect { is_authenticated });
        server.notify(ServerEventKind::Connection {
            socket_id: self.id().clone(),
            is_authenticated,
        });
    }

    /// Verify `signed`, run authenticate middleware and apply the claims.
    /// Any failure leaves the socket unauthenticated.
    async fn process_token(&self, signed: &str) -> Result<(), WireError> {
        let server = &self.inner.server;
        let claims = match server.auth.verify(signed).await {
            Ok(claims) => claims,
            Err(e) => {
                debug!(socket_id = %self.id(), error = %e, "auth token rejected");
                let error = WireError::from(&e);
                let _ = self.deauthenticate_self();
                server.notify(ServerEventKind::BadSocketAuthToken {
                    socket_id: self.id().clone(),
                    error: error.clone(),
                });
                return Err(error);
            }
        };
        let mut action = self.action_request(MiddlewareKind::Authenticate);
        action.auth_token = Some(claims.clone());
        action.signed_auth_token = Some(signed.to_string());
        let message = match server.middleware.run(action).await {
            PipelineOutcome::Allow(_) => {
                self.apply_token(claims, signed.to_string());
                return Ok(());
            }
            PipelineOutcome::Block(err) => {
                server.middleware_warning(Some(self.id()), &err);
                err.message
            }
            PipelineOutcome::SilentBlock(err) => err.to_string(),
        };
        let _ = self.deauthenticate_self();
        Err(WireError::new("AuthenticateMiddlewareError", message))
    }

    async fn subscribe_checked(&self, request: SubscribeRequest) -> Result<(), WireError> {
        let SubscribeRequest {
            channel,
            wait_for_auth,
            data,
            ..
        } = request;
        check_channel_name(&channel).map_err(|e| WireError::from(&e))?;
        if wait_for_auth && self.auth_state() != AuthState::Authenticated {
            let error = InvalidActionError(format!(
                "cannot subscribe to {channel:?} before authenticating"
            ));
            return Err(WireError::from(&error));
        }
        if self.is_subscribed(&channel) {
            return Ok(());
        }
        let server = &self.inner.server;
        let mut action = self.action_request(MiddlewareKind::Subscribe);
        action.channel = Some(channel.clone());
        action.data = data.unwrap_or(Value::Null);
        match server.middleware.run(action).await {
            PipelineOutcome::Allow(_) => {}
            PipelineOutcome::Block(err) => {
                server.middleware_warning(Some(self.id()), &err);
                return Err(WireError::from(&err));
            }
            PipelineOutcome::SilentBlock(err) => return Err(WireError::from(&err)),
        }
        server
            .broker
            .subscribe(self.id(), &channel)
            .await
            .map_err(|e| WireError::from(&e))?;

        let added = {
            let mut state = self.inner.state.lock();
            state.connection != ConnectionState::Closed && state.channels.insert(channel.clone())
        };
        if !added {
            if self.state() == ConnectionState::Closed {
                let _ = server.broker.unsubscribe(self.id(), &channel).await;
            }
            return Ok(());
        }
        debug!(socket_id = %self.id(), channel, "subscribed");
        gauge!(SUBSCRIPTIONS_ACTIVE).increment(1.0);
        self.emit(SocketEvent::Subscribe {
            channel: channel.clone(),
        });
        server.notify(ServerEventKind::Subscription {
            socket_id: self.id().clone(),
            channel,
        });
        Ok(())
    }

    async fn leave_channel(&self, channel: &str) -> bool {
        if !self.inner.state.lock().channels.remove(channel) {
            return false;
        }
        if let Err(e) = self.inner.server.broker.unsubscribe(self.id(), channel).await {
            warn!(socket_id = %self.id(), channel, error = %e, "broker unsubscribe failed");
        }
        self.channel_left(channel);
        true
    }

    fn channel_left(&self, channel: &str) {
        debug!(socket_id = %self.id(), channel, "unsubscribed");
        gauge!(SUBSCRIPTIONS_ACTIVE).decrement(1.0);
        self.emit(SocketEvent::Unsubscribe {
            channel: channel.to_string(),
        });
        self.inner.server.notify(ServerEventKind::Unsubscription {
            socket_id: self.id().clone(),
            channel: channel.to_string(),
        });
    }

    async fn publish_checked(&self, publication: Publication) -> Result<(), WireError> {
        let server = &self.inner.server;
        if !server.settings.allow_client_publish {
            let error = InvalidActionError("client publish is disabled".into());
            return Err(WireError::from(&error));
        }
        let Publication { channel, data } = publication;
        check_channel_name(&channel).map_err(|e| WireError::from(&e))?;
        let mut action = self.action_request(MiddlewareKind::PublishIn);
        action.channel = Some(channel.clone());
        action.data = data;
        let data = match server.middleware.run(action).await {
            PipelineOutcome::Allow(request) => request.data,
            PipelineOutcome::Block(err) => {
                server.middleware_warning(Some(self.id()), &err);
                return Err(WireError::from(&err));
            }
            PipelineOutcome::SilentBlock(err) => return Err(WireError::from(&err)),
        };
        server
            .publish(&channel, data)
            .await
            .map_err(|e| WireError::from(&e))
    }

    async fn on_app_event(&self, event: String, data: Value, cid: Option<CallId>) {
        let server = &self.inner.server;
        let kind = if cid.is_some() {
            MiddlewareKind::Invoke
        } else {
            MiddlewareKind::Transmit
        };
        let mut action = self.action_request(kind);
        action.event = Some(event.clone());
        action.data = data;
        let data = match server.middleware.run(action).await {
            PipelineOutcome::Allow(request) => request.data,
            PipelineOutcome::Block(err) => {
                server.middleware_warning(Some(self.id()), &err);
                self.answer(cid, Err(WireError::from(&err)));
                return;
            }
            PipelineOutcome::SilentBlock(err) => {
                self.answer(cid, Err(WireError::from(&err)));
                return;
            }
        };
        match cid {
            Some(rid) => {
                let request = ProcedureRequest::new(event.clone(), data, rid, self.response_sink());
                self.inner.procedures.write(&event, request);
            }
            None => self.inner.receivers.write(&event, data),
        }
    }

    /// Deliver a broker publication, after publish-out middleware.
    pub(crate) async fn deliver(&self, publication: &BrokerPublication) {
        if self.state() != ConnectionState::Open || !self.is_subscribed(&publication.channel) {
            return;
        }
        let server = &self.inner.server;
        let mut action = self.action_request(MiddlewareKind::PublishOut);
        action.channel = Some(publication.channel.clone());
        action.data = publication.data.clone();
        let data = match server.middleware.run(action).await {
            PipelineOutcome::Allow(request) => request.data,
            PipelineOutcome::Block(err) => {
                server.middleware_warning(Some(self.id()), &err);
                return;
            }
            PipelineOutcome::SilentBlock(_) => return,
        };
        let payload = serde_json::to_value(Publication {
            channel: publication.channel.clone(),
            data,
        })
        .unwrap_or(Value::Null);
        match self.send_event(EventEnvelope::new(reserved::PUBLISH, payload)) {
            Ok(()) => counter!(PUBLICATIONS_DELIVERED_TOTAL).increment(1),
            Err(e) => debug!(socket_id = %self.id(), error = %e, "publication not delivered"),
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn action_request(&self, kind: MiddlewareKind) -> ActionRequest {
        let state = self.inner.state.lock();
        ActionRequest {
            socket_id: Some(self.id().clone()),
            remote_addr: self.inner.info.remote_addr,
            origin: self.inner.info.origin.clone(),
            auth_token: state.token.clone(),
            signed_auth_token: state.signed_token.clone(),
            ..ActionRequest::new(kind)
        }
    }

    fn apply_token(&self, claims: Value, signed: String) {
        {
            let mut state = self.inner.state.lock();
            state.token = Some(claims.clone());
            state.signed_token = Some(signed.clone());
            state.auth = AuthState::Authenticated;
        }
        debug!(socket_id = %self.id(), "authenticated");
        self.emit(SocketEvent::Authenticate {
            signed_token: signed,
        });
        self.inner.server.notify(ServerEventKind::Authentication {
            socket_id: self.id().clone(),
            auth_token: claims,
        });
    }

    /// Clear the token locally. Returns `false` when there was none.
    fn deauthenticate_self(&self) -> bool {
        let (old_token, old_signed) = {
            let mut state = self.inner.state.lock();
            if state.auth == AuthState::Unauthenticated && state.token.is_none() {
                return false;
            }
            state.auth = AuthState::Unauthenticated;
            (state.token.take(), state.signed_token.take())
        };
        debug!(socket_id = %self.id(), "deauthenticated");
        self.emit(SocketEvent::Deauthenticate {
            old_signed_token: old_signed,
        });
        self.inner.server.notify(ServerEventKind::Deauthentication {
            socket_id: self.id().clone(),
            old_auth_token: old_token,
        });
        true
    }

    fn emit(&self, event: SocketEvent) {
        self.inner.listeners.write(event.name(), event);
    }

    fn warning(&self, error: WireError) {
        self.inner.server.warn(Some(self.id()), error);
    }

    /// Answer an inbound call; errors for transmits are only logged.
    fn answer(&self, cid: Option<CallId>, result: Result<Value, WireError>) {
        match (cid, result) {
            (Some(rid), Ok(data)) => self.respond(ResponseEnvelope::ok(rid, data)),
            (Some(rid), Err(error)) => self.respond(ResponseEnvelope::err(rid, &error)),
            (None, Ok(_)) => {}
            (None, Err(error)) => debug!(socket_id = %self.id(), %error, "transmit refused"),
        }
    }

    fn respond(&self, response: ResponseEnvelope) {
        let packet = Envelope::Response(response).to_value();
        if let Err(e) = self.write_packet(&packet) {
            debug!(socket_id = %self.id(), error = %e, "failed to send response");
        }
    }

    fn response_sink(&self) -> Arc<dyn ResponseSink> {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |response: ResponseEnvelope| {
            if let Some(inner) = weak.upgrade() {
                let socket = Self { inner };
                if socket.state() != ConnectionState::Closed {
                    socket.respond(response);
                }
            }
        })
    }

    fn send_event(&self, envelope: EventEnvelope) -> Result<(), CallError> {
        if self.state() == ConnectionState::Closed {
            return Err(bad_connection(&envelope.event));
        }
        self.write_packet(&Envelope::Event(envelope).to_value())
    }

    fn write_packet(&self, packet: &Value) -> Result<(), CallError> {
        let text = self.inner.server.codec.encode(packet)?;
        self.inner.link.send_text(text)?;
        Ok(())
    }
}

fn bad_connection(event: &str) -> CallError {
    BadConnectionError {
        event: event.to_string(),
        kind: ConnectionLossKind::Disconnect,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Server;
    use assert_matches::assert_matches;
    use tether_core::link::Link;
    use tether_settings::ServerSettings;

    async fn accepted() -> (Server, ServerSocket, Link) {
        let server = Server::new(ServerSettings::default());
        let (client, peer) = Link::pair();
        let socket = server
            .accept(peer, HandshakeInfo::default())
            .await
            .unwrap();
        (server, socket, client)
    }

    #[tokio::test]
    async fn new_socket_is_connecting_and_registered() {
        let (server, socket, _client) = accepted().await;
        assert_eq!(socket.state(), ConnectionState::Connecting);
        assert_eq!(socket.auth_state(), AuthState::Unauthenticated);
        assert!(server.socket(socket.id()).is_some());
        assert_eq!(server.clients_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_unregisters_and_is_idempotent() {
        let (server, socket, mut client) = accepted().await;
        socket.disconnect(close_codes::NORMAL, "bye");
        socket.disconnect(close_codes::NORMAL, "again");
        assert_eq!(socket.state(), ConnectionState::Closed);
        assert!(server.socket(socket.id()).is_none());
        assert_eq!(
            client.receiver.recv().await,
            Some(Frame::Close {
                code: close_codes::NORMAL,
                reason: "bye".into()
            })
        );
    }

    #[tokio::test]
    async fn outbound_after_close_is_a_bad_connection() {
        let (_server, socket, _client) = accepted().await;
        socket.disconnect(close_codes::NORMAL, "");
        assert_matches!(
            socket.transmit("chat", Value::Null),
            Err(CallError::BadConnection(_))
        );
        assert_matches!(
            socket.invoke("chat", Value::Null).await,
            Err(CallError::BadConnection(_))
        );
    }

    #[tokio::test]
    async fn reserved_event_names_are_refused() {
        let (_server, socket, _client) = accepted().await;
        assert_matches!(
            socket.transmit("#publish", Value::Null),
            Err(CallError::Protocol(ProtocolError::ReservedEvent(_)))
        );
    }

    #[tokio::test]
    async fn pending_invoke_fails_when_socket_closes() {
        let (_server, socket, _client) = accepted().await;
        let call = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.invoke_with_timeout("ask", Value::Null, None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(socket.pending_calls(), 1);
        socket.disconnect(close_codes::GOING_AWAY, "");
        assert_matches!(
            call.await.unwrap(),
            Err(CallError::BadConnection(BadConnectionError {
                kind: ConnectionLossKind::ConnectAbort,
                ..
            }))
        );
    }
}
