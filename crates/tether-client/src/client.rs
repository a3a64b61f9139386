//! Client session.
//!
//! A [`Client`] owns one logical connection that survives any number of
//! physical links. Each link gets an epoch number; callbacks from timers and
//! tasks carry the epoch they were created for and are ignored once it is
//! stale, so an old link can never mutate the state of a newer one.
//!
//! All mutable session state (connection and auth state, the call table,
//! the outbound buffer, the channel table, batching) sits behind one
//! `parking_lot::Mutex`. Notifications are written to the listener stream
//! while that lock is held, which is what orders them against call results:
//! on connection loss the `disconnect`/`connectAbort` record is written
//! before any pending call is rejected.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tether_auth::decode_unverified;
use tether_core::close_codes;
use tether_core::codec::{Codec, InboundFrame, JsonCodec, PONG, decode_frame};
use tether_core::correlator::{CallCorrelator, CallReceiver, CallResult, spawn_timer};
use tether_core::envelope::{
    Action, AuthStatus, Envelope, EventEnvelope, HandshakeRequest, HandshakeResponse, KickOut,
    Publication, ResponseEnvelope, check_channel_name, check_event_name, parse_packet, reserved,
};
use tether_core::errors::{
    BadConnectionError, CallError, ConnectionLossKind, InvalidActionError, ProtocolError,
    SocketProtocolError, TransportError, WireError,
};
use tether_core::ids::{CallId, SocketId};
use tether_core::keepalive::{Activity, DeadlineResult, watch_deadline};
use tether_core::link::{Frame, Link, LinkSender};
use tether_core::procedure::{ProcedureRequest, ResponseSink};
use tether_core::state::{AuthState, ConnectionState};
use tether_core::stream::{MultiplexedStream, Reader};
use tether_settings::ClientSettings;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::channel::{ChannelRegistry, ChannelState, SubscribeOptions};
use crate::connector::{Connector, WsConnector};
use crate::events::ClientEvent;
use crate::token_store::{MemoryTokenStore, TokenStore};

type SendResult = Result<(), CallError>;

/// How long an invoke waits for its response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckTimeout {
    /// The session's `ack_timeout_ms`.
    #[default]
    Default,
    /// A specific timeout.
    After(Duration),
    /// Wait indefinitely.
    Never,
}

/// Per-call emit options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmitOptions {
    /// Send in the next batch instead of immediately.
    pub batch: bool,
    /// Response deadline (invokes only).
    pub ack_timeout: AckTimeout,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Configures and creates a [`Client`].
pub struct ClientBuilder {
    settings: ClientSettings,
    connector: Option<Arc<dyn Connector>>,
    codec: Option<Arc<dyn Codec>>,
    token_store: Option<Arc<dyn TokenStore>>,
}

impl ClientBuilder {
    /// Builder with the given settings and default collaborators.
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            connector: None,
            codec: None,
            token_store: None,
        }
    }

    /// Transport (default: [`WsConnector`]).
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Packet codec (default: [`JsonCodec`]).
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Token storage (default: [`MemoryTokenStore`]).
    #[must_use]
    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    /// Create the client. Connects right away when `auto_connect` is set,
    /// so this must run inside a tokio runtime.
    pub fn build(self) -> Client {
        let auto_connect = self.settings.auto_connect;
        let client = Client {
            inner: Arc::new(ClientInner {
                settings: self.settings,
                connector: self.connector.unwrap_or_else(|| Arc::new(WsConnector)),
                codec: self.codec.unwrap_or_else(|| Arc::new(JsonCodec)),
                token_store: self
                    .token_store
                    .unwrap_or_else(|| Arc::new(MemoryTokenStore::new())),
                session: Mutex::new(Session::new()),
                listeners: MultiplexedStream::new(),
                receivers: MultiplexedStream::new(),
                procedures: MultiplexedStream::new(),
                channel_data: MultiplexedStream::new(),
            }),
        };
        if auto_connect {
            client.connect();
        }
        client
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session state
// ─────────────────────────────────────────────────────────────────────────────

struct PendingReconnect {
    delay: Duration,
    timer: AbortHandle,
}

struct Outbound {
    envelope: EventEnvelope,
    batch: bool,
    /// Completion of a transmit; invokes complete through the call table.
    sent: Option<oneshot::Sender<SendResult>>,
}

#[derive(Default)]
struct BatchState {
    manual: bool,
    buffer: Vec<Value>,
    flush_timer: Option<AbortHandle>,
    /// End of the post-handshake batching window.
    window: Option<AbortHandle>,
}

struct Session {
    id: Option<SocketId>,
    connection: ConnectionState,
    auth: AuthState,
    signed_token: Option<String>,
    token: Option<Value>,
    ping_timeout: Duration,
    reconnect_attempts: u32,
    pending_reconnect: Option<PendingReconnect>,
    user_closed: bool,
    epoch: u64,
    link: Option<LinkSender>,
    link_cancel: CancellationToken,
    activity: Arc<Activity>,
    handshake_cid: Option<CallId>,
    handshake_token: Option<String>,
    correlator: CallCorrelator,
    outbound: VecDeque<Outbound>,
    channels: ChannelRegistry,
    batch: BatchState,
    /// Last queued token-store write. Each write waits for this one.
    token_write: Option<JoinHandle<()>>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: None,
            connection: ConnectionState::Closed,
            auth: AuthState::Unauthenticated,
            signed_token: None,
            token: None,
            ping_timeout: Duration::ZERO,
            reconnect_attempts: 0,
            pending_reconnect: None,
            user_closed: false,
            epoch: 0,
            link: None,
            link_cancel: CancellationToken::new(),
            activity: Arc::new(Activity::new()),
            handshake_cid: None,
            handshake_token: None,
            correlator: CallCorrelator::new(),
            outbound: VecDeque::new(),
            channels: ChannelRegistry::new(),
            batch: BatchState::default(),
            token_write: None,
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.connection != ConnectionState::Closed
    }
}

struct ClientInner {
    settings: ClientSettings,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    token_store: Arc<dyn TokenStore>,
    session: Mutex<Session>,
    listeners: MultiplexedStream<ClientEvent>,
    receivers: MultiplexedStream<Value>,
    procedures: MultiplexedStream<ProcedureRequest>,
    channel_data: MultiplexedStream<Value>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        session.link_cancel.cancel();
        if let Some(pending) = session.pending_reconnect.take() {
            pending.timer.abort();
        }
        for timer in [session.batch.flush_timer.take(), session.batch.window.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        self.listeners.close_all();
        self.receivers.close_all();
        self.procedures.close_all();
        self.channel_data.close_all();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// A reconnecting tether client. Cloning yields another handle to the same
/// session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start configuring a client.
    pub fn builder(settings: ClientSettings) -> ClientBuilder {
        ClientBuilder::new(settings)
    }

    /// Settings the client was built with.
    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Socket id assigned by the last handshake.
    pub fn id(&self) -> Option<SocketId> {
        self.inner.session.lock().id.clone()
    }

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().connection
    }

    /// Auth state.
    pub fn auth_state(&self) -> AuthState {
        self.inner.session.lock().auth
    }

    /// Claims of the current token, decoded without verification.
    pub fn auth_token(&self) -> Option<Value> {
        self.inner.session.lock().token.clone()
    }

    /// Current signed token.
    pub fn signed_auth_token(&self) -> Option<String> {
        self.inner.session.lock().signed_token.clone()
    }

    /// Delay of the scheduled reconnect, if one is pending.
    pub fn pending_reconnect_delay(&self) -> Option<Duration> {
        self.inner
            .session
            .lock()
            .pending_reconnect
            .as_ref()
            .map(|p| p.delay)
    }

    /// Reconnects scheduled since the last user [`connect`](Self::connect).
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.session.lock().reconnect_attempts
    }

    /// Number of invokes awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.session.lock().correlator.len()
    }

    /// Open the connection if it is closed. Resets the reconnect counter.
    pub fn connect(&self) {
        let mut session = self.inner.session.lock();
        if session.connection == ConnectionState::Closed {
            session.reconnect_attempts = 0;
            self.inner.start_connect(&mut session);
        }
    }

    /// Close the connection and suppress automatic reconnects.
    pub fn disconnect(&self, code: u16, reason: &str) {
        let mut session = self.inner.session.lock();
        session.user_closed = true;
        if let Some(pending) = session.pending_reconnect.take() {
            pending.timer.abort();
        }
        if session.connection != ConnectionState::Closed {
            self.inner.close_link_locked(&mut session, code, reason);
        }
    }

    /// Close the current connection (if any) and open a new one.
    pub fn reconnect(&self, code: u16, reason: &str) {
        self.disconnect(code, reason);
        self.connect();
    }

    // ── Calls ───────────────────────────────────────────────────────────────

    /// Send a fire-and-forget event. Completes once the envelope is handed
    /// to the transport (or to the current batch).
    pub async fn transmit(&self, event: &str, data: Value) -> Result<(), CallError> {
        self.transmit_with(event, data, EmitOptions::default()).await
    }

    /// [`transmit`](Self::transmit) with explicit options.
    pub async fn transmit_with(
        &self,
        event: &str,
        data: Value,
        options: EmitOptions,
    ) -> Result<(), CallError> {
        check_event_name(event)?;
        self.inner.send(event, data, options.batch).await
    }

    /// Call a remote procedure with the default ack timeout.
    pub async fn invoke(&self, event: &str, data: Value) -> Result<Value, CallError> {
        self.invoke_with(event, data, EmitOptions::default()).await
    }

    /// Call a remote procedure with a specific ack timeout.
    pub async fn invoke_with_timeout(
        &self,
        event: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let options = EmitOptions {
            ack_timeout: AckTimeout::After(timeout),
            ..EmitOptions::default()
        };
        self.invoke_with(event, data, options).await
    }

    /// [`invoke`](Self::invoke) with explicit options.
    pub async fn invoke_with(
        &self,
        event: &str,
        data: Value,
        options: EmitOptions,
    ) -> Result<Value, CallError> {
        check_event_name(event)?;
        let timeout = match options.ack_timeout {
            AckTimeout::Default => Some(self.inner.ack_timeout()),
            AckTimeout::After(timeout) => Some(timeout),
            AckTimeout::Never => None,
        };
        self.inner.call(event, data, options.batch, timeout).await
    }

    // ── Auth ────────────────────────────────────────────────────────────────

    /// Present `signed_token` to the server.
    ///
    /// On acceptance the token is stored and the client becomes
    /// authenticated. A rejection clears the token; a lost connection or a
    /// timeout leaves the auth state unchanged.
    #[instrument(skip_all)]
    pub async fn authenticate(&self, signed_token: &str) -> Result<AuthStatus, CallError> {
        let inner = &self.inner;
        let result = inner
            .call(
                reserved::AUTHENTICATE,
                Value::String(signed_token.to_string()),
                false,
                Some(inner.ack_timeout()),
            )
            .await;
        let status = match result.and_then(|data| {
            serde_json::from_value::<AuthStatus>(data).map_err(|e| {
                ProtocolError::invalid_payload(reserved::AUTHENTICATE, e.to_string()).into()
            })
        }) {
            Ok(status) => status,
            Err(err) => {
                if !matches!(err, CallError::BadConnection(_) | CallError::Timeout(_)) {
                    inner.change_to_unauthenticated(&mut inner.session.lock());
                }
                return Err(err);
            }
        };
        if let Some(err) = &status.auth_error {
            inner.change_to_unauthenticated(&mut inner.session.lock());
            return Err(CallError::Remote(err.clone()));
        }
        if !status.is_authenticated {
            inner.change_to_unauthenticated(&mut inner.session.lock());
            return Ok(status);
        }
        inner.save_token(signed_token).await;
        inner.change_to_authenticated(&mut inner.session.lock(), signed_token.to_string());
        Ok(status)
    }

    /// Drop the current token locally, in the token store and on the server.
    pub async fn deauthenticate(&self) {
        let inner = &self.inner;
        let old_token = inner.remove_stored_token().await;
        let mut session = inner.session.lock();
        if session.connection == ConnectionState::Open {
            let envelope = EventEnvelope::new(reserved::REMOVE_AUTH_TOKEN, Value::Null);
            inner.enqueue(&mut session, envelope, false, None);
        }
        inner.change_to_unauthenticated(&mut session);
        inner.notify(ClientEvent::RemoveAuthToken { old_token });
    }

    // ── Channels ────────────────────────────────────────────────────────────

    /// Subscribe to `channel`, or update the options of an existing
    /// subscription. Negotiation starts immediately when the connection is
    /// open.
    pub fn subscribe(
        &self,
        channel: &str,
        options: SubscribeOptions,
    ) -> Result<ChannelState, ProtocolError> {
        check_channel_name(channel)?;
        let mut session = self.inner.session.lock();
        if session.channels.subscribe(channel, options) {
            debug!(channel, "channel created");
        }
        self.inner.try_subscribe(&mut session, channel);
        Ok(session
            .channels
            .state(channel)
            .unwrap_or(ChannelState::Pending))
    }

    /// Remove `channel`, cancelling any negotiation in flight.
    pub fn unsubscribe(&self, channel: &str) {
        let mut session = self.inner.session.lock();
        let Some(removed) = session.channels.remove(channel) else {
            return;
        };
        if let Some(cid) = removed.pending_call {
            let _ = session.correlator.cancel(cid);
        }
        if session.connection == ConnectionState::Open
            && (removed.state == ChannelState::Subscribed || removed.pending_call.is_some())
        {
            let envelope = EventEnvelope::new(reserved::UNSUBSCRIBE, Value::from(channel));
            self.inner.enqueue(&mut session, envelope, false, None);
        }
        self.inner.notify_removed(channel, removed.state);
    }

    /// Unsubscribe and end every reader of the channel's data stream.
    pub fn close_channel(&self, channel: &str) {
        self.unsubscribe(channel);
        self.inner.channel_data.close(channel);
    }

    /// State of `channel`, `None` when not subscribed at all.
    pub fn channel_state(&self, channel: &str) -> Option<ChannelState> {
        self.inner.session.lock().channels.state(channel)
    }

    /// Whether `channel` is subscribed (or pending, with `include_pending`).
    pub fn is_subscribed(&self, channel: &str, include_pending: bool) -> bool {
        self.inner
            .session
            .lock()
            .channels
            .is_subscribed(channel, include_pending)
    }

    /// Subscribed channel names (plus pending ones, with `include_pending`).
    pub fn subscriptions(&self, include_pending: bool) -> Vec<String> {
        self.inner.session.lock().channels.names(include_pending)
    }

    /// Publish to `channel` and wait for the server's acknowledgement.
    pub async fn publish(&self, channel: &str, data: Value) -> Result<(), CallError> {
        let data = publication(channel, data)?;
        let timeout = Some(self.inner.ack_timeout());
        self.inner
            .call(reserved::PUBLISH, data, false, timeout)
            .await
            .map(|_| ())
    }

    /// Publish to `channel` without waiting for acknowledgement.
    pub async fn transmit_publish(&self, channel: &str, data: Value) -> Result<(), CallError> {
        let data = publication(channel, data)?;
        self.inner.send(reserved::PUBLISH, data, false).await
    }

    // ── Batching ────────────────────────────────────────────────────────────

    /// Hold every outbound envelope until [`flush_batch`](Self::flush_batch)
    /// or [`stop_batching`](Self::stop_batching).
    pub fn start_batching(&self) {
        self.inner.session.lock().batch.manual = true;
    }

    /// Stop holding envelopes and flush what was held.
    pub fn stop_batching(&self) {
        let mut session = self.inner.session.lock();
        session.batch.manual = false;
        if let Some(window) = session.batch.window.take() {
            window.abort();
        }
        self.inner.flush_batch_logged(&mut session);
    }

    /// Send every held envelope as one array packet.
    pub fn flush_batch(&self) {
        let mut session = self.inner.session.lock();
        self.inner.flush_batch_logged(&mut session);
    }

    // ── Streams ─────────────────────────────────────────────────────────────

    /// Notifications named `name` (see [`ClientEvent::name`]).
    pub fn listener(&self, name: &str) -> Reader<ClientEvent> {
        self.inner.listeners.reader(name)
    }

    /// Payloads of transmits named `event`.
    pub fn receiver(&self, event: &str) -> Reader<Value> {
        self.inner.receivers.reader(event)
    }

    /// Invokes named `event`, each awaiting an answer.
    pub fn procedure(&self, event: &str) -> Reader<ProcedureRequest> {
        self.inner.procedures.reader(event)
    }

    /// Publications on `channel`.
    pub fn channel_stream(&self, channel: &str) -> Reader<Value> {
        self.inner.channel_data.reader(channel)
    }
}

fn publication(channel: &str, data: Value) -> Result<Value, CallError> {
    check_channel_name(channel)?;
    let publication = Publication {
        channel: channel.to_string(),
        data,
    };
    serde_json::to_value(publication).map_err(|e| {
        CallError::Codec(tether_core::codec::CodecError::Encode(e.to_string()))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound path
// ─────────────────────────────────────────────────────────────────────────────

impl ClientInner {
    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.ack_timeout_ms)
    }

    fn notify(&self, event: ClientEvent) {
        self.listeners.write(event.name(), event);
    }

    async fn send(self: &Arc<Self>, event: &str, data: Value, batch: bool) -> SendResult {
        let (tx, rx) = oneshot::channel();
        {
            let mut session = self.session.lock();
            self.enqueue(&mut session, EventEnvelope::new(event, data), batch, Some(tx));
        }
        rx.await.unwrap_or_else(|_| Err(bad_connection(event)))
    }

    async fn call(
        self: &Arc<Self>,
        event: &str,
        data: Value,
        batch: bool,
        timeout: Option<Duration>,
    ) -> CallResult {
        let rx = {
            let mut session = self.session.lock();
            let (cid, rx) = session.correlator.register(event);
            if let Some(timeout) = timeout {
                let weak = Arc::downgrade(self);
                let timer = spawn_timer(timeout, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire_call(cid);
                    }
                });
                session.correlator.attach_timer(cid, timer);
            }
            let envelope = EventEnvelope::new(event, data).with_cid(cid);
            self.enqueue(&mut session, envelope, batch, None);
            rx
        };
        rx.await.unwrap_or_else(|_| Err(bad_connection(event)))
    }

    /// Send now when open, otherwise queue (connecting first when closed
    /// and `auto_connect` is set).
    fn enqueue(
        self: &Arc<Self>,
        session: &mut Session,
        envelope: EventEnvelope,
        batch: bool,
        sent: Option<oneshot::Sender<SendResult>>,
    ) {
        if session.connection == ConnectionState::Open {
            let result = self.send_envelope(session, &envelope, batch);
            settle_outbound(session, envelope.cid, sent, result);
            return;
        }
        session.outbound.push_back(Outbound {
            envelope,
            batch,
            sent,
        });
        if session.connection == ConnectionState::Closed && self.settings.auto_connect {
            self.start_connect(session);
        }
    }

    fn flush_outbound(self: &Arc<Self>, session: &mut Session) {
        while let Some(item) = session.outbound.pop_front() {
            let result = self.send_envelope(session, &item.envelope, item.batch);
            settle_outbound(session, item.envelope.cid, item.sent, result);
        }
    }

    fn send_envelope(
        self: &Arc<Self>,
        session: &mut Session,
        envelope: &EventEnvelope,
        batch: bool,
    ) -> SendResult {
        let packet = Envelope::Event(envelope.clone()).to_value();
        self.send_packet(session, packet, batch)
    }

    fn send_packet(self: &Arc<Self>, session: &mut Session, packet: Value, batch: bool) -> SendResult {
        if session.batch.manual || batch {
            session.batch.buffer.push(packet);
            if !session.batch.manual && session.batch.flush_timer.is_none() {
                let weak = Arc::downgrade(self);
                let epoch = session.epoch;
                let delay = Duration::from_millis(self.settings.batch_interval_ms);
                session.batch.flush_timer = Some(spawn_timer(delay, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_batch_timer(epoch);
                    }
                }));
            }
            return Ok(());
        }
        self.flush_batch(session)?;
        self.write_packet(session, &packet)
    }

    fn flush_batch(&self, session: &mut Session) -> SendResult {
        if let Some(timer) = session.batch.flush_timer.take() {
            timer.abort();
        }
        if session.batch.buffer.is_empty() {
            return Ok(());
        }
        let mut packets = std::mem::take(&mut session.batch.buffer);
        let packet = if packets.len() == 1 {
            packets.swap_remove(0)
        } else {
            Value::Array(packets)
        };
        self.write_packet(session, &packet)
    }

    fn flush_batch_logged(&self, session: &mut Session) {
        if session.connection != ConnectionState::Open {
            return;
        }
        if let Err(e) = self.flush_batch(session) {
            warn!(error = %e, "failed to flush batch");
        }
    }

    fn write_packet(&self, session: &Session, packet: &Value) -> SendResult {
        let link = session.link.as_ref().ok_or(TransportError::Closed)?;
        let text = self.codec.encode(packet)?;
        link.send_text(text)?;
        Ok(())
    }

    fn on_batch_timer(&self, epoch: u64) {
        let mut session = self.session.lock();
        if session.epoch != epoch {
            return;
        }
        session.batch.flush_timer = None;
        self.flush_batch_logged(&mut session);
    }

    fn end_handshake_batch(&self, epoch: u64) {
        let mut session = self.session.lock();
        if session.epoch != epoch || session.batch.window.is_none() {
            return;
        }
        session.batch.window = None;
        session.batch.manual = false;
        self.flush_batch_logged(&mut session);
    }

    fn expire_call(&self, cid: CallId) {
        let mut session = self.session.lock();
        if session.correlator.expire(cid) {
            session.outbound.retain(|o| o.envelope.cid != Some(cid));
        }
    }

    fn send_response(self: &Arc<Self>, epoch: u64, response: ResponseEnvelope) {
        let mut session = self.session.lock();
        if !session.is_current(epoch) {
            debug!(rid = %response.rid, "dropping response for a closed connection");
            return;
        }
        let packet = Envelope::Response(response).to_value();
        if let Err(e) = self.send_packet(&mut session, packet, false) {
            warn!(error = %e, "failed to send response");
        }
    }

    fn response_sink(self: &Arc<Self>, epoch: u64) -> Arc<dyn ResponseSink> {
        let weak = Arc::downgrade(self);
        Arc::new(move |response: ResponseEnvelope| {
            if let Some(inner) = weak.upgrade() {
                inner.send_response(epoch, response);
            }
        })
    }
}

fn bad_connection(event: &str) -> CallError {
    BadConnectionError {
        event: event.to_string(),
        kind: ConnectionLossKind::Disconnect,
    }
    .into()
}

fn settle_outbound(
    session: &mut Session,
    cid: Option<CallId>,
    sent: Option<oneshot::Sender<SendResult>>,
    result: SendResult,
) {
    match (sent, result, cid) {
        (Some(tx), result, _) => {
            let _ = tx.send(result);
        }
        (None, Err(err), Some(cid)) => {
            let _ = session.correlator.reject(cid, err);
        }
        _ => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection lifecycle
// ─────────────────────────────────────────────────────────────────────────────

impl ClientInner {
    fn start_connect(self: &Arc<Self>, session: &mut Session) {
        if let Some(pending) = session.pending_reconnect.take() {
            pending.timer.abort();
        }
        session.epoch += 1;
        session.connection = ConnectionState::Connecting;
        session.user_closed = false;
        session.link_cancel = CancellationToken::new();
        session.activity = Arc::new(Activity::new());
        self.notify(ClientEvent::Connecting);
        let _ = tokio::spawn(run_link(
            Arc::downgrade(self),
            session.epoch,
            session.link_cancel.clone(),
            Arc::clone(&session.activity),
        ));
    }

    /// Install the link and send `#handshake`. Returns `false` when the
    /// connection attempt went stale while dialing.
    fn begin_handshake(
        self: &Arc<Self>,
        epoch: u64,
        sender: LinkSender,
        token: Option<String>,
        timeout: Duration,
    ) -> bool {
        let mut session = self.session.lock();
        if session.epoch != epoch || session.connection != ConnectionState::Connecting {
            sender.close(close_codes::NORMAL, "connection attempt superseded");
            return false;
        }
        session.link = Some(sender);
        let request = HandshakeRequest {
            auth_token: token.clone(),
        };
        let data = serde_json::to_value(request).unwrap_or(Value::Null);
        let (cid, _rx) = session.correlator.register(reserved::HANDSHAKE);
        let weak = Arc::downgrade(self);
        let timer = spawn_timer(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_handshake_timeout(epoch, cid);
            }
        });
        session.correlator.attach_timer(cid, timer);
        session.handshake_cid = Some(cid);
        session.handshake_token = token;
        let packet = Envelope::Event(EventEnvelope::new(reserved::HANDSHAKE, data).with_cid(cid));
        if let Err(e) = self.write_packet(&session, &packet.to_value()) {
            warn!(error = %e, "failed to send handshake");
        }
        true
    }

    fn on_handshake_timeout(self: &Arc<Self>, epoch: u64, cid: CallId) {
        let mut session = self.session.lock();
        if session.epoch != epoch || session.handshake_cid != Some(cid) {
            return;
        }
        let _ = session.correlator.cancel(cid);
        session.handshake_cid = None;
        warn!("handshake timed out");
        let code = close_codes::CONNECT_TIMEOUT;
        self.close_link_locked(&mut session, code, close_codes::describe(code));
    }

    fn on_handshake_response(self: &Arc<Self>, session: &mut Session, result: Result<Value, WireError>) {
        let response = result.and_then(|data| {
            serde_json::from_value::<HandshakeResponse>(data).map_err(|e| {
                WireError::from(&ProtocolError::invalid_payload(
                    reserved::HANDSHAKE,
                    e.to_string(),
                ))
            })
        });
        match response {
            Ok(response) => self.open(session, response),
            Err(err) => {
                warn!(error = %err, "handshake rejected");
                let code = err
                    .data
                    .as_ref()
                    .and_then(|d| d.get("statusCode"))
                    .and_then(Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(close_codes::HANDSHAKE_REJECTED);
                let reason = err.message.clone();
                self.notify(ClientEvent::Error { error: err });
                self.close_link_locked(session, code, &reason);
            }
        }
    }

    fn open(self: &Arc<Self>, session: &mut Session, response: HandshakeResponse) {
        let token = session.handshake_token.take();
        session.connection = ConnectionState::Open;
        session.id = Some(response.id.clone());
        session.ping_timeout = Duration::from_millis(response.ping_timeout);
        info!(id = %response.id, authenticated = response.is_authenticated, "connected");

        if self.settings.batch_on_handshake {
            session.batch.manual = true;
            let weak = Arc::downgrade(self);
            let epoch = session.epoch;
            let window = Duration::from_millis(self.settings.batch_on_handshake_duration_ms);
            session.batch.window = Some(spawn_timer(window, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.end_handshake_batch(epoch);
                }
            }));
        }

        match token {
            Some(token) if response.is_authenticated => {
                self.change_to_authenticated(session, token);
            }
            _ => self.change_to_unauthenticated(session),
        }
        if self.settings.auto_subscribe_on_connect {
            self.process_pending_subscriptions(session);
        }
        self.notify(ClientEvent::Connect {
            id: response.id,
            ping_timeout_ms: response.ping_timeout,
            is_authenticated: session.auth == AuthState::Authenticated,
            auth_error: response.auth_error,
        });
        self.flush_outbound(session);

        if !self.settings.ping_timeout_disabled {
            self.start_ping_watchdog(session);
        }
    }

    fn start_ping_watchdog(self: &Arc<Self>, session: &Session) {
        let weak = Arc::downgrade(self);
        let activity = Arc::clone(&session.activity);
        let cancel = session.link_cancel.clone();
        let timeout = session.ping_timeout;
        let epoch = session.epoch;
        let _ = tokio::spawn(async move {
            if watch_deadline(&activity, timeout, &cancel).await != DeadlineResult::TimedOut {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.close_link(epoch, close_codes::PING_TIMEOUT, "Server ping timed out");
            }
        });
    }

    fn close_link(self: &Arc<Self>, epoch: u64, code: u16, reason: &str) {
        let mut session = self.session.lock();
        if session.is_current(epoch) {
            self.close_link_locked(&mut session, code, reason);
        }
    }

    /// Close our side of the link, then run the close sequence.
    fn close_link_locked(self: &Arc<Self>, session: &mut Session, code: u16, reason: &str) {
        if let Some(link) = &session.link {
            link.close(code, reason);
        }
        self.close_locked(session, code, reason);
    }

    fn handle_close(self: &Arc<Self>, epoch: u64, code: u16, reason: &str) {
        let mut session = self.session.lock();
        if session.is_current(epoch) {
            self.close_locked(&mut session, code, reason);
        }
    }

    /// Tear down the current link: notify, reject everything outstanding,
    /// suspend channels, then schedule a reconnect when appropriate.
    fn close_locked(self: &Arc<Self>, session: &mut Session, code: u16, reason: &str) {
        let was = session.connection;
        if was == ConnectionState::Closed {
            return;
        }
        let reason = if reason.is_empty() {
            close_codes::describe(code).to_string()
        } else {
            reason.to_string()
        };
        session.connection = ConnectionState::Closed;
        session.link = None;
        session.handshake_cid = None;
        session.handshake_token = None;
        session.link_cancel.cancel();
        if let Some(timer) = session.batch.flush_timer.take() {
            timer.abort();
        }
        if let Some(window) = session.batch.window.take() {
            window.abort();
            session.batch.manual = false;
        }
        session.batch.buffer.clear();

        if !close_codes::is_ignored(code) {
            let err = SocketProtocolError {
                code,
                message: close_codes::describe(code).to_string(),
            };
            self.notify(ClientEvent::Error {
                error: WireError::from(&err),
            });
        }
        let kind = if was == ConnectionState::Open {
            self.notify(ClientEvent::Disconnect {
                code,
                reason: reason.clone(),
            });
            ConnectionLossKind::Disconnect
        } else {
            self.notify(ClientEvent::ConnectAbort {
                code,
                reason: reason.clone(),
            });
            ConnectionLossKind::ConnectAbort
        };

        let aborted = session.correlator.abort_all(kind);
        for item in session.outbound.drain(..) {
            if let Some(tx) = item.sent {
                let err = BadConnectionError {
                    event: item.envelope.event,
                    kind,
                };
                let _ = tx.send(Err(err.into()));
            }
        }
        for channel in session.channels.suspend_all() {
            self.notify(ClientEvent::SubscribeStateChange {
                channel,
                old: ChannelState::Subscribed,
                new: ChannelState::Pending,
            });
        }
        self.notify(ClientEvent::Close {
            code,
            reason: reason.clone(),
        });
        info!(code, %reason, aborted, "connection closed");

        if session.user_closed || !self.settings.auto_reconnect || code == close_codes::NORMAL {
            return;
        }
        let Some(delay) = self
            .settings
            .reconnect
            .delay_for_close(code, session.reconnect_attempts)
        else {
            debug!(code, "close code forbids reconnecting");
            return;
        };
        session.reconnect_attempts = session.reconnect_attempts.saturating_add(1);
        let weak = Arc::downgrade(self);
        let epoch = session.epoch;
        let timer = spawn_timer(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_reconnect_timer(epoch);
            }
        });
        debug!(?delay, attempt = session.reconnect_attempts, "reconnect scheduled");
        session.pending_reconnect = Some(PendingReconnect { delay, timer });
    }

    fn on_reconnect_timer(self: &Arc<Self>, epoch: u64) {
        let mut session = self.session.lock();
        if session.epoch != epoch || session.connection != ConnectionState::Closed {
            return;
        }
        session.pending_reconnect = None;
        self.start_connect(&mut session);
    }
}

/// Dial, handshake and pump inbound frames for one link.
#[instrument(skip(weak, cancel, activity))]
async fn run_link(
    weak: Weak<ClientInner>,
    epoch: u64,
    cancel: CancellationToken,
    activity: Arc<Activity>,
) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let connect_timeout = Duration::from_millis(inner.settings.connect_timeout_ms);
    let deadline = tokio::time::Instant::now() + connect_timeout;
    let connector = Arc::clone(&inner.connector);
    let store = Arc::clone(&inner.token_store);
    let uri = inner.settings.uri.clone();
    let token_name = inner.settings.auth_token_name.clone();
    drop(inner);

    let dial = async {
        let link = connector.connect(&uri).await?;
        let token = store.load(&token_name).await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to load auth token");
            None
        });
        Ok::<(Link, Option<String>), TransportError>((link, token))
    };
    let outcome = tokio::select! {
        () = cancel.cancelled() => return,
        outcome = tokio::time::timeout_at(deadline, dial) => outcome,
    };
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let (link, token) = match outcome {
        Ok(Ok(dialed)) => dialed,
        Ok(Err(e)) => {
            warn!(error = %e, "connect failed");
            inner.handle_close(epoch, close_codes::ABNORMAL, &e.to_string());
            return;
        }
        Err(_) => {
            warn!(%uri, "connect timed out");
            let code = close_codes::CONNECT_TIMEOUT;
            inner.handle_close(epoch, code, close_codes::describe(code));
            return;
        }
    };
    let Link {
        sender,
        mut receiver,
    } = link;
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    if !inner.begin_handshake(epoch, sender, token, remaining) {
        return;
    }
    drop(inner);

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = receiver.recv() => frame.unwrap_or_else(Frame::hung_up),
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match frame {
            Frame::Text(text) => {
                activity.touch();
                inner.on_text(epoch, &text);
            }
            Frame::Close { code, reason } => {
                inner.handle_close(epoch, code, &reason);
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound path
// ─────────────────────────────────────────────────────────────────────────────

impl ClientInner {
    fn on_text(self: &Arc<Self>, epoch: u64, text: &str) {
        let frame = match decode_frame(self.codec.as_ref(), text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable frame");
                self.notify(ClientEvent::Error {
                    error: WireError::new("CodecError", e.to_string()),
                });
                return;
            }
        };
        let mut session = self.session.lock();
        if !session.is_current(epoch) {
            return;
        }
        match frame {
            InboundFrame::Ping => {
                if let Some(link) = &session.link {
                    let _ = link.send_text(PONG.to_string());
                }
            }
            InboundFrame::Pong => {}
            InboundFrame::Packet(packet) => {
                for envelope in parse_packet(packet) {
                    // A handler may have closed the link mid-batch.
                    if !session.is_current(epoch) {
                        break;
                    }
                    match envelope {
                        Ok(Envelope::Response(response)) => self.on_response(&mut session, response),
                        Ok(Envelope::Event(event)) => self.on_event(&mut session, epoch, event),
                        Err(e) => {
                            warn!(error = %e, "malformed envelope");
                            self.notify(ClientEvent::Error {
                                error: WireError::from(&e),
                            });
                        }
                    }
                }
            }
        }
    }

    fn on_response(self: &Arc<Self>, session: &mut Session, response: ResponseEnvelope) {
        if session.handshake_cid == Some(response.rid) {
            session.handshake_cid = None;
            let _ = session.correlator.cancel(response.rid);
            self.on_handshake_response(session, response.into_result());
            return;
        }
        let _ = session.correlator.resolve(response);
    }

    fn on_event(self: &Arc<Self>, session: &mut Session, epoch: u64, envelope: EventEnvelope) {
        let EventEnvelope { event, data, cid } = envelope;
        match Action::parse(event, data) {
            Ok(Action::Publish(publication)) => {
                if session.channels.state(&publication.channel).is_some() {
                    self.channel_data
                        .write(&publication.channel, publication.data);
                } else {
                    debug!(channel = %publication.channel, "publication for unknown channel");
                    self.notify(ClientEvent::Unrouted {
                        event: reserved::PUBLISH.to_string(),
                        data: Value::from(publication.channel),
                    });
                }
            }
            Ok(Action::KickOut(kick)) => self.on_kick_out(session, kick),
            Ok(Action::SetAuthToken(set)) => self.on_set_auth_token(session, set.token),
            Ok(Action::RemoveAuthToken) => self.on_remove_auth_token(session),
            Ok(Action::Event { event, data }) => match cid {
                Some(rid) => {
                    let request =
                        ProcedureRequest::new(event.clone(), data, rid, self.response_sink(epoch));
                    self.procedures.write(&event, request);
                }
                None => self.receivers.write(&event, data),
            },
            Ok(other) => {
                warn!(action = other.name(), "unexpected action from server");
                if let Some(rid) = cid {
                    let err = InvalidActionError(format!(
                        "{} is not accepted by clients",
                        other.name()
                    ));
                    self.respond_error(session, rid, &WireError::from(&err));
                }
            }
            Err(e) => {
                warn!(error = %e, "invalid inbound event");
                match cid {
                    Some(rid) => self.respond_error(session, rid, &WireError::from(&e)),
                    None => self.notify(ClientEvent::Error {
                        error: WireError::from(&e),
                    }),
                }
            }
        }
    }

    fn respond_error(self: &Arc<Self>, session: &mut Session, rid: CallId, err: &WireError) {
        let packet = Envelope::Response(ResponseEnvelope::err(rid, err)).to_value();
        if let Err(e) = self.send_packet(session, packet, false) {
            warn!(error = %e, "failed to send error response");
        }
    }

    fn on_kick_out(self: &Arc<Self>, session: &mut Session, kick: KickOut) {
        let Some(removed) = session.channels.remove(&kick.channel) else {
            return;
        };
        if let Some(cid) = removed.pending_call {
            let _ = session.correlator.cancel(cid);
        }
        info!(channel = %kick.channel, "kicked out of channel");
        self.notify(ClientEvent::KickOut {
            channel: kick.channel.clone(),
            message: kick.message,
        });
        self.notify_removed(&kick.channel, removed.state);
    }

    fn notify_removed(&self, channel: &str, old: ChannelState) {
        if old == ChannelState::Subscribed {
            self.notify(ClientEvent::SubscribeStateChange {
                channel: channel.to_string(),
                old,
                new: ChannelState::Unsubscribed,
            });
            self.notify(ClientEvent::Unsubscribe {
                channel: channel.to_string(),
            });
        }
    }

    fn on_set_auth_token(self: &Arc<Self>, session: &mut Session, token: String) {
        self.persist_token(session, TokenWrite::Save(token.clone()));
        self.change_to_authenticated(session, token);
    }

    fn on_remove_auth_token(self: &Arc<Self>, session: &mut Session) {
        let old_token = session.signed_token.clone();
        self.persist_token(session, TokenWrite::Remove);
        self.change_to_unauthenticated(session);
        self.notify(ClientEvent::RemoveAuthToken { old_token });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth state
// ─────────────────────────────────────────────────────────────────────────────

/// A server-driven change to the token store.
enum TokenWrite {
    Save(String),
    Remove,
}

impl ClientInner {
    /// Queue a token-store write behind the previous one so the store sees
    /// server-driven changes in arrival order.
    fn persist_token(self: &Arc<Self>, session: &mut Session, write: TokenWrite) {
        let previous = session.token_write.take();
        let weak = Arc::downgrade(self);
        session.token_write = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match write {
                TokenWrite::Save(token) => inner.save_token(&token).await,
                TokenWrite::Remove => {
                    let _ = inner.remove_stored_token().await;
                }
            }
        }));
    }

    async fn save_token(&self, token: &str) {
        if let Err(e) = self
            .token_store
            .save(&self.settings.auth_token_name, token)
            .await
        {
            warn!(error = %e, "failed to save auth token");
            self.notify(ClientEvent::Error {
                error: WireError::new("AuthTokenError", e.to_string()),
            });
        }
    }

    async fn remove_stored_token(&self) -> Option<String> {
        match self
            .token_store
            .remove(&self.settings.auth_token_name)
            .await
        {
            Ok(old) => old,
            Err(e) => {
                warn!(error = %e, "failed to remove auth token");
                self.notify(ClientEvent::Error {
                    error: WireError::new("AuthTokenError", e.to_string()),
                });
                None
            }
        }
    }

    fn change_to_authenticated(self: &Arc<Self>, session: &mut Session, signed_token: String) {
        session.token = decode_unverified(&signed_token);
        session.signed_token = Some(signed_token.clone());
        let old = session.auth;
        if old != AuthState::Authenticated {
            session.auth = AuthState::Authenticated;
            self.notify(ClientEvent::AuthStateChange {
                old,
                new: AuthState::Authenticated,
            });
            self.process_pending_subscriptions(session);
        }
        self.notify(ClientEvent::Authenticate { signed_token });
    }

    fn change_to_unauthenticated(&self, session: &mut Session) {
        let old_signed_token = session.signed_token.take();
        session.token = None;
        if session.auth == AuthState::Authenticated {
            session.auth = AuthState::Unauthenticated;
            self.notify(ClientEvent::AuthStateChange {
                old: AuthState::Authenticated,
                new: AuthState::Unauthenticated,
            });
            self.notify(ClientEvent::Deauthenticate { old_signed_token });
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel negotiation
// ─────────────────────────────────────────────────────────────────────────────

impl ClientInner {
    fn process_pending_subscriptions(self: &Arc<Self>, session: &mut Session) {
        if session.connection != ConnectionState::Open {
            return;
        }
        for channel in session.channels.pending_in_priority_order() {
            self.try_subscribe(session, &channel);
        }
    }

    /// Send the `#subscribe` negotiation for `channel` if it is pending,
    /// idle and allowed to negotiate now.
    fn try_subscribe(self: &Arc<Self>, session: &mut Session, channel: &str) {
        if session.connection != ConnectionState::Open
            || session.channels.state(channel) != Some(ChannelState::Pending)
            || session.channels.is_negotiating(channel)
        {
            return;
        }
        let Some(options) = session.channels.options(channel) else {
            return;
        };
        if options.wait_for_auth && session.auth != AuthState::Authenticated {
            debug!(channel, "channel waits for authentication");
            return;
        }
        let batch = options.batch;
        let Some(request) = session.channels.request(channel) else {
            return;
        };
        let data = serde_json::to_value(request).unwrap_or(Value::Null);
        let (cid, rx) = session.correlator.register(reserved::SUBSCRIBE);
        let _ = session.channels.mark_negotiating(channel, cid);
        self.notify(ClientEvent::SubscribeRequest {
            channel: channel.to_string(),
        });
        let envelope = EventEnvelope::new(reserved::SUBSCRIBE, data).with_cid(cid);
        self.enqueue(session, envelope, batch, None);
        self.await_subscription(channel.to_string(), cid, rx);
    }

    fn await_subscription(self: &Arc<Self>, channel: String, cid: CallId, rx: CallReceiver) {
        let weak = Arc::downgrade(self);
        let _ = tokio::spawn(async move {
            // A dropped responder means the negotiation was withdrawn.
            let Ok(result) = rx.await else {
                return;
            };
            if let Some(inner) = weak.upgrade() {
                inner.on_subscribe_result(&channel, cid, result);
            }
        });
    }

    fn on_subscribe_result(&self, channel: &str, cid: CallId, result: CallResult) {
        let mut session = self.session.lock();
        if !session.channels.owns_negotiation(channel, cid) {
            return;
        }
        match result {
            Ok(_) => {
                if let Some(old) = session.channels.on_success(channel) {
                    debug!(channel, "subscribed");
                    self.notify(ClientEvent::SubscribeStateChange {
                        channel: channel.to_string(),
                        old,
                        new: ChannelState::Subscribed,
                    });
                    self.notify(ClientEvent::Subscribe {
                        channel: channel.to_string(),
                    });
                }
            }
            Err(err @ (CallError::BadConnection(_) | CallError::Transport(_))) => {
                debug!(channel, error = %err, "negotiation lost with the connection");
                session.channels.clear_negotiation(channel);
            }
            Err(err) => {
                warn!(channel, error = %err, "subscribe failed");
                let _ = session.channels.remove(channel);
                self.notify(ClientEvent::SubscribeFail {
                    channel: channel.to_string(),
                    error: WireError::from(&err),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemoryConnector;
    use assert_matches::assert_matches;

    fn idle_client() -> Client {
        let (connector, _peers) = MemoryConnector::new();
        let settings = ClientSettings {
            auto_connect: false,
            ..ClientSettings::for_uri("mem://test")
        };
        Client::builder(settings)
            .connector(Arc::new(connector))
            .build()
    }

    #[tokio::test]
    async fn starts_closed_without_auto_connect() {
        let client = idle_client();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.auth_state(), AuthState::Unauthenticated);
        assert!(client.id().is_none());
        assert!(client.pending_reconnect_delay().is_none());
    }

    #[tokio::test]
    async fn reserved_names_are_rejected() {
        let client = idle_client();
        assert_matches!(
            client.transmit("#handshake", Value::Null).await,
            Err(CallError::Protocol(ProtocolError::ReservedEvent(_)))
        );
        assert_matches!(
            client.invoke("#publish", Value::Null).await,
            Err(CallError::Protocol(ProtocolError::ReservedEvent(_)))
        );
    }

    #[tokio::test]
    async fn empty_channel_names_are_rejected() {
        let client = idle_client();
        assert!(client.subscribe("", SubscribeOptions::default()).is_err());
        assert!(client.publish("", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn subscribe_while_closed_stays_pending() {
        let client = idle_client();
        let state = client.subscribe("news", SubscribeOptions::default()).unwrap();
        assert_eq!(state, ChannelState::Pending);
        assert!(client.is_subscribed("news", true));
        assert!(!client.is_subscribed("news", false));
        assert_eq!(client.subscriptions(true), ["news"]);
        client.unsubscribe("news");
        assert!(client.channel_state("news").is_none());
    }

    #[tokio::test]
    async fn disconnect_when_closed_is_noop() {
        let client = idle_client();
        let mut closes = client.listener("close");
        client.disconnect(close_codes::NORMAL, "");
        assert!(futures::FutureExt::now_or_never(closes.next_record()).is_none());
    }
}
