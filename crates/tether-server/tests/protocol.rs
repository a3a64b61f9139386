//! Server socket behavior driven frame by frame over an in-process link.

use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::{Value, json};
use tether_core::close_codes;
use tether_core::link::{Frame, Link};
use tether_core::state::ConnectionState;
use tether_core::stream::Reader;
use tether_server::{
    HandshakeInfo, MiddlewareError, MiddlewareKind, Server, ServerEvent, ServerEventKind,
    ServerSocket, SocketEvent, from_fn,
};
use tether_settings::ServerSettings;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(60);

/// Client end of one accepted link.
struct Peer {
    link: Link,
}

impl Peer {
    async fn frame(&mut self) -> Frame {
        timeout(TIMEOUT, self.link.receiver.recv())
            .await
            .expect("no frame from server")
            .expect("server dropped the link")
    }

    /// Next JSON packet, skipping pings.
    async fn packet(&mut self) -> Value {
        loop {
            match self.frame().await {
                Frame::Text(text) if text == "#1" => {}
                Frame::Text(text) => return serde_json::from_str(&text).unwrap(),
                Frame::Close { code, reason } => panic!("server closed: {code} {reason}"),
            }
        }
    }

    /// Next close frame, skipping everything else.
    async fn close(&mut self) -> (u16, String) {
        loop {
            if let Frame::Close { code, reason } = self.frame().await {
                return (code, reason);
            }
        }
    }

    fn send(&self, packet: &Value) {
        self.link.sender.send_text(packet.to_string()).unwrap();
    }

    async fn call(&mut self, event: &str, data: Value, cid: u64) -> Value {
        self.send(&json!({"event": event, "data": data, "cid": cid}));
        let response = self.packet().await;
        assert_eq!(response["rid"], cid);
        response
    }

    async fn handshake(&mut self) -> Value {
        let response = self.call("#handshake", json!({}), 1).await;
        assert!(response.get("error").is_none(), "handshake failed: {response}");
        response["data"].clone()
    }
}

async fn next<T: Clone>(reader: &mut Reader<T>) -> T {
    timeout(TIMEOUT, reader.next_record())
        .await
        .expect("no record")
        .expect("stream ended")
        .expect("reader timed out")
}

async fn accept(server: &Server) -> (ServerSocket, Peer) {
    let (client, peer) = Link::pair();
    let socket = server
        .accept(peer, HandshakeInfo::default())
        .await
        .expect("accept refused");
    (socket, Peer { link: client })
}

async fn open(server: &Server) -> (ServerSocket, Peer) {
    let (socket, mut peer) = accept(server).await;
    let _ = peer.handshake().await;
    (socket, peer)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_response_carries_id_and_ping_timeout() {
    let server = Server::new(ServerSettings::default());
    let mut connections = server.listener("connection");
    let (socket, mut peer) = accept(&server).await;

    let data = peer.handshake().await;
    assert_eq!(data["id"], socket.id().as_str());
    assert_eq!(data["pingTimeout"], 20_000);
    assert_eq!(data["isAuthenticated"], false);
    assert_eq!(socket.state(), ConnectionState::Open);

    let event: ServerEvent = next(&mut connections).await;
    assert_matches!(
        event.kind,
        ServerEventKind::Connection { is_authenticated: false, .. }
    );
}

#[tokio::test]
async fn message_before_handshake_is_refused_without_closing() {
    let server = Server::new(ServerSettings::default());
    let (socket, mut peer) = accept(&server).await;

    let response = peer.call("chat", json!(1), 7).await;
    assert_eq!(response["error"]["name"], "InvalidActionError");
    assert_eq!(socket.state(), ConnectionState::Connecting);

    let _ = peer.handshake().await;
    assert_eq!(socket.state(), ConnectionState::Open);
}

#[tokio::test]
async fn second_handshake_is_refused() {
    let server = Server::new(ServerSettings::default());
    let (_socket, mut peer) = open(&server).await;
    let response = peer.call("#handshake", json!({}), 2).await;
    assert_eq!(response["error"]["name"], "InvalidActionError");
}

#[tokio::test]
async fn bad_token_is_reported_but_handshake_succeeds() {
    let server = Server::new(ServerSettings::default());
    let mut bad_tokens = server.listener("badSocketAuthToken");
    let (_socket, mut peer) = accept(&server).await;

    let response = peer
        .call("#handshake", json!({"authToken": "not-a-jwt"}), 1)
        .await;
    assert_eq!(response["data"]["isAuthenticated"], false);
    assert!(response["data"]["authError"]["name"].is_string());
    assert_matches!(
        next(&mut bad_tokens).await.kind,
        ServerEventKind::BadSocketAuthToken { .. }
    );
}

#[tokio::test]
async fn handshake_middleware_status_closes_with_that_code() {
    let server = Server::new(ServerSettings::default());
    server.middleware().add(
        MiddlewareKind::HandshakeProtocol,
        from_fn("maintenance", |_req| async {
            Err(MiddlewareError::named("MaintenanceError", "come back later").with_status(4555))
        }),
    );
    let (socket, mut peer) = accept(&server).await;

    let response = peer.call("#handshake", json!({}), 1).await;
    assert_eq!(response["error"]["name"], "MaintenanceError");
    assert_eq!(response["error"]["data"]["statusCode"], 4555);
    assert_eq!(peer.close().await.0, 4555);
    assert_eq!(socket.state(), ConnectionState::Closed);
    assert_eq!(server.clients_count(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Timers
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn handshake_timeout_closes_with_4005() {
    let server = Server::new(ServerSettings::default());
    let (socket, mut peer) = accept(&server).await;
    let mut aborts = socket.listener("connectAbort");

    assert_eq!(peer.close().await.0, close_codes::HANDSHAKE_TIMEOUT);
    assert_matches!(
        next(&mut aborts).await,
        SocketEvent::ConnectAbort { code: close_codes::HANDSHAKE_TIMEOUT, .. }
    );
}

#[tokio::test(start_paused = true)]
async fn server_pings_on_the_configured_interval() {
    let server = Server::new(ServerSettings {
        ping_interval_ms: 1_000,
        ..ServerSettings::default()
    });
    let (_socket, mut peer) = open(&server).await;
    assert_eq!(peer.frame().await, Frame::Text("#1".into()));
}

#[tokio::test(start_paused = true)]
async fn silent_client_is_closed_with_4001() {
    let server = Server::new(ServerSettings::default());
    let (socket, mut peer) = open(&server).await;
    let mut disconnects = socket.listener("disconnect");

    assert_eq!(peer.close().await.0, close_codes::PONG_TIMEOUT);
    assert_matches!(
        next(&mut disconnects).await,
        SocketEvent::Disconnect { code: close_codes::PONG_TIMEOUT, .. }
    );
}

#[tokio::test(start_paused = true)]
async fn disabled_ping_timeout_keeps_silent_client() {
    let server = Server::new(ServerSettings {
        ping_timeout_disabled: true,
        ..ServerSettings::default()
    });
    let (socket, _peer) = open(&server).await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(socket.state(), ConnectionState::Open);
}

#[tokio::test]
async fn client_ping_is_answered_with_pong() {
    let server = Server::new(ServerSettings::default());
    let (_socket, mut peer) = open(&server).await;
    peer.link.sender.send_text("#1".into()).unwrap();
    assert_eq!(peer.frame().await, Frame::Text("#2".into()));
}

// ─────────────────────────────────────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn wait_for_auth_subscription_needs_a_token() {
    let server = Server::new(ServerSettings::default());
    let (socket, mut peer) = open(&server).await;
    let response = peer
        .call("#subscribe", json!({"channel": "vip", "waitForAuth": true}), 2)
        .await;
    assert_eq!(response["error"]["name"], "InvalidActionError");
    assert!(!socket.is_subscribed("vip"));
}

#[tokio::test]
async fn subscribe_then_receive_server_publication() {
    let server = Server::new(ServerSettings::default());
    let (socket, mut peer) = open(&server).await;
    let response = peer.call("#subscribe", json!({"channel": "news"}), 2).await;
    assert!(response.get("error").is_none());
    assert_eq!(socket.subscriptions(), ["news"]);

    server.publish("news", json!({"headline": "hi"})).await.unwrap();
    let publication = peer.packet().await;
    assert_eq!(publication["event"], "#publish");
    assert_eq!(publication["data"]["channel"], "news");
    assert_eq!(publication["data"]["data"]["headline"], "hi");
}

#[tokio::test]
async fn client_publish_can_be_disabled() {
    let server = Server::new(ServerSettings {
        allow_client_publish: false,
        ..ServerSettings::default()
    });
    let (_socket, mut peer) = open(&server).await;
    let response = peer
        .call("#publish", json!({"channel": "news", "data": 1}), 2)
        .await;
    assert_eq!(response["error"]["name"], "InvalidActionError");
}

#[tokio::test]
async fn unsubscribe_leaves_the_broker() {
    let server = Server::new(ServerSettings::default());
    let (socket, mut peer) = open(&server).await;
    let _ = peer.call("#subscribe", json!({"channel": "news"}), 2).await;
    assert_eq!(server.broker().subscribers("news").await, [socket.id().clone()]);

    let _ = peer.call("#unsubscribe", json!("news"), 3).await;
    assert!(!socket.is_subscribed("news"));
    assert!(server.broker().subscribers("news").await.is_empty());
}

#[tokio::test]
async fn client_cannot_send_server_only_actions() {
    let server = Server::new(ServerSettings::default());
    let (_socket, mut peer) = open(&server).await;
    let response = peer
        .call("#kickOut", json!({"channel": "news"}), 2)
        .await;
    assert_eq!(response["error"]["name"], "ProtocolError");
}

// ─────────────────────────────────────────────────────────────────────────────
// Calls
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn inbound_invoke_reaches_procedure_stream() {
    let server = Server::new(ServerSettings::default());
    let (socket, mut peer) = open(&server).await;
    let mut adds = socket.procedure("add");

    peer.send(&json!({"event": "add", "data": [2, 3], "cid": 5}));
    let request = next(&mut adds).await;
    let sum: i64 = request
        .data()
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_i64)
        .sum();
    request.end(json!(sum)).unwrap();

    let response = peer.packet().await;
    assert_eq!(response, json!({"rid": 5, "data": 5}));
}

#[tokio::test(start_paused = true)]
async fn outbound_invoke_times_out() {
    let server = Server::new(ServerSettings {
        ack_timeout_ms: 500,
        ping_timeout_disabled: true,
        ..ServerSettings::default()
    });
    let (socket, _peer) = open(&server).await;
    assert_matches!(
        socket.invoke("ask", Value::Null).await,
        Err(tether_core::errors::CallError::Timeout(_))
    );
    assert_eq!(socket.pending_calls(), 0);
}
