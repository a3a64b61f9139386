//! End-to-end tests: a real server on an ephemeral port and real clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::StreamExt;
use serde_json::{Value, json};
use tether_auth::SignOptions;
use tether_client::{Client, ClientEvent, MemoryTokenStore, SubscribeOptions, TokenStore};
use tether_core::close_codes;
use tether_core::errors::CallError;
use tether_core::state::{AuthState, ConnectionState};
use tether_core::stream::Reader;
use tether_server::{MiddlewareError, MiddlewareKind, Server, ServerSocket, from_fn};
use tether_settings::{ClientSettings, ServerSettings};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

const TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN_NAME: &str = "tether.authToken";

async fn listen(settings: ServerSettings) -> (Server, SocketAddr, JoinHandle<()>) {
    let server = Server::new(ServerSettings {
        host: "127.0.0.1".into(),
        port: 0,
        ..settings
    });
    let (addr, handle) = server.listen().await.expect("bind");
    (server, addr, handle)
}

fn client_settings(addr: SocketAddr) -> ClientSettings {
    ClientSettings {
        auto_connect: false,
        auto_reconnect: false,
        ..ClientSettings::for_uri(format!("ws://{addr}/ws"))
    }
}

async fn next<T: Clone>(reader: &mut Reader<T>) -> T {
    timeout(TIMEOUT, reader.next_record())
        .await
        .expect("no record")
        .expect("stream ended")
        .expect("reader timed out")
}

/// Connect a client and wait for its handshake.
async fn connect_with(client: &Client) -> ClientEvent {
    let mut connects = client.listener("connect");
    client.connect();
    next(&mut connects).await
}

async fn connected(addr: SocketAddr) -> Client {
    let client = Client::builder(client_settings(addr)).build();
    let _ = connect_with(&client).await;
    client
}

fn socket_for(server: &Server, client: &Client) -> ServerSocket {
    let id = client.id().expect("client has no id");
    server.socket(&id).expect("server has no such socket")
}

async fn subscribed(client: &Client, channel: &str) {
    let mut subs = client.listener("subscribe");
    let _ = client
        .subscribe(channel, SubscribeOptions::default())
        .unwrap();
    assert_matches!(next(&mut subs).await, ClientEvent::Subscribe { .. });
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP surface
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoint_counts_connections() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    let _client = connected(addr).await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    assert_eq!(server.clients_count(), 1);
}

#[tokio::test]
async fn disallowed_origin_is_closed_with_4003() {
    let (_server, addr, _handle) = listen(ServerSettings {
        allowed_origins: vec!["https://app.example".into()],
        ..ServerSettings::default()
    })
    .await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://evil.example"));
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let msg = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_matches!(
        msg,
        Message::Close(Some(frame)) if u16::from(frame.code) == close_codes::HANDSHAKE_TRANSPORT_FAILURE
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake and auth
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn client_handshake_is_seen_by_both_ends() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    let mut connections = server.listener("connection");
    let client = Client::builder(client_settings(addr)).build();

    let event = connect_with(&client).await;
    assert_matches!(
        event,
        ClientEvent::Connect { ping_timeout_ms: 20_000, is_authenticated: false, .. }
    );
    assert_eq!(client.state(), ConnectionState::Open);

    let event = next(&mut connections).await;
    assert_eq!(event.socket_id(), client.id().as_ref());
}

#[tokio::test]
async fn authenticate_middleware_filters_stored_tokens() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    server.middleware().add(
        MiddlewareKind::Authenticate,
        from_fn("alice-only", |req| async move {
            let user = req.auth_token.as_ref().and_then(|t| t.get("username")).cloned();
            if user == Some(json!("alice")) {
                Ok(req)
            } else {
                Err(MiddlewareError::new("only alice may sign in"))
            }
        }),
    );

    for (user, accepted) in [("alice", true), ("mallory", false)] {
        let signed = server
            .auth_engine()
            .sign(&json!({"username": user}), &SignOptions::default())
            .await
            .unwrap();
        let store = Arc::new(MemoryTokenStore::new());
        store.save(TOKEN_NAME, &signed).await.unwrap();
        let client = Client::builder(client_settings(addr))
            .token_store(store)
            .build();

        let event = connect_with(&client).await;
        let ClientEvent::Connect { is_authenticated, auth_error, .. } = event else {
            panic!("expected connect, got {event:?}");
        };
        assert_eq!(is_authenticated, accepted, "{user}");
        assert_eq!(client.state(), ConnectionState::Open);
        if accepted {
            assert!(auth_error.is_none());
            assert_eq!(socket_for(&server, &client).auth_state(), AuthState::Authenticated);
        } else {
            assert_eq!(auth_error.unwrap().name, "AuthenticateMiddlewareError");
            assert_eq!(
                socket_for(&server, &client).auth_state(),
                AuthState::Unauthenticated
            );
        }
    }
}

#[tokio::test]
async fn server_issued_token_reaches_client() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    let client = connected(addr).await;
    let mut auths = client.listener("authenticate");

    let socket = socket_for(&server, &client);
    let signed = socket
        .set_auth_token(json!({"username": "bob"}))
        .await
        .unwrap();

    assert_eq!(
        next(&mut auths).await,
        ClientEvent::Authenticate {
            signed_token: signed.clone()
        }
    );
    assert_eq!(socket.auth_state(), AuthState::Authenticated);
    assert_eq!(socket.auth_token().unwrap()["username"], "bob");
    let claims = server.auth_engine().verify(&signed).await.unwrap();
    assert_eq!(claims["username"], "bob");
}

#[tokio::test]
async fn handshake_middleware_status_aborts_client() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    server.middleware().add(
        MiddlewareKind::HandshakeProtocol,
        from_fn("closed", |_req| async {
            Err(MiddlewareError::new("not today").with_status(4555))
        }),
    );
    let client = Client::builder(client_settings(addr)).build();
    let mut aborts = client.listener("connectAbort");
    client.connect();

    assert_matches!(next(&mut aborts).await, ClientEvent::ConnectAbort { code: 4555, .. });
    assert_eq!(client.state(), ConnectionState::Closed);
}

// ─────────────────────────────────────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn publication_fans_out_to_subscribers() {
    let (_server, addr, _handle) = listen(ServerSettings::default()).await;
    let reader = connected(addr).await;
    let writer = connected(addr).await;
    subscribed(&reader, "news").await;
    let mut news = reader.channel_stream("news");

    writer.publish("news", json!({"headline": "hi"})).await.unwrap();
    assert_eq!(next(&mut news).await, json!({"headline": "hi"}));
}

#[tokio::test]
async fn publish_in_middleware_can_refuse() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    server.middleware().add(
        MiddlewareKind::PublishIn,
        from_fn("read-only", |req| async move {
            if req.channel.as_deref() == Some("announcements") {
                Err(MiddlewareError::named("ReadOnlyError", "announcements are read-only"))
            } else {
                Ok(req)
            }
        }),
    );
    let client = connected(addr).await;

    let err = client
        .publish("announcements", json!("spam"))
        .await
        .unwrap_err();
    assert_matches!(err, CallError::Remote(ref e) if e.name == "ReadOnlyError");
    assert!(client.publish("chatter", json!("ok")).await.is_ok());
}

#[tokio::test]
async fn publish_out_middleware_rewrites_per_recipient() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    server.middleware().add(
        MiddlewareKind::PublishOut,
        from_fn("stamp", |mut req| async move {
            let socket = req.socket_id.as_ref().map(|id| id.to_string());
            req.data = json!({"for": socket, "body": req.data});
            Ok(req)
        }),
    );
    let client = connected(addr).await;
    subscribed(&client, "news").await;
    let mut news = client.channel_stream("news");

    server.publish("news", json!(1)).await.unwrap();
    let received = next(&mut news).await;
    assert_eq!(received["body"], 1);
    assert_eq!(received["for"], client.id().unwrap().as_str());
}

#[tokio::test]
async fn kick_out_removes_client_from_channel() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    let client = connected(addr).await;
    subscribed(&client, "room").await;
    let mut kicks = client.listener("kickOut");

    let socket = socket_for(&server, &client);
    assert!(socket.kick_out("room", Some("bye")).await);
    assert!(!socket.is_subscribed("room"));
    assert!(!socket.kick_out("room", None).await);

    assert_eq!(
        next(&mut kicks).await,
        ClientEvent::KickOut {
            channel: "room".into(),
            message: Some("bye".into()),
        }
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Calls
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn client_invoke_is_answered_by_server_procedure() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    let client = connected(addr).await;
    let mut echoes = socket_for(&server, &client).procedure("echo");

    let answer = tokio::spawn(async move {
        let request = next(&mut echoes).await;
        let data = request.data().clone();
        request.end(json!({"echo": data})).unwrap();
    });
    let result = client.invoke("echo", json!("hello")).await.unwrap();
    assert_eq!(result, json!({"echo": "hello"}));
    answer.await.unwrap();
}

#[tokio::test]
async fn server_invoke_is_answered_by_client_procedure() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    let client = connected(addr).await;
    let mut whoami = client.procedure("whoami");
    let id = client.id().unwrap();

    let answer = tokio::spawn(async move {
        let request = next(&mut whoami).await;
        request.end(json!(id.as_str())).unwrap();
    });
    let socket = socket_for(&server, &client);
    let result = socket.invoke("whoami", Value::Null).await.unwrap();
    assert_eq!(result, json!(socket.id().as_str()));
    answer.await.unwrap();
}

#[tokio::test]
async fn transmit_middleware_rewrites_payload() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    server.middleware().add(
        MiddlewareKind::Transmit,
        from_fn("wrap", |mut req| async move {
            req.data = json!({"wrapped": req.data});
            Ok(req)
        }),
    );
    let client = connected(addr).await;
    let mut chats = socket_for(&server, &client).receiver("chat");

    client.transmit("chat", json!("hi")).await.unwrap();
    assert_eq!(next(&mut chats).await, json!({"wrapped": "hi"}));
}

#[tokio::test]
async fn server_transmit_reaches_client_receiver() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    let client = connected(addr).await;
    let mut notices = client.receiver("notice");

    socket_for(&server, &client)
        .transmit("notice", json!({"text": "maintenance at noon"}))
        .unwrap();
    assert_eq!(next(&mut notices).await["text"], "maintenance at noon");
}

// ─────────────────────────────────────────────────────────────────────────────
// Shutdown
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn server_close_disconnects_clients_with_going_away() {
    let (server, addr, handle) = listen(ServerSettings {
        shutdown_timeout_ms: 2_000,
        ..ServerSettings::default()
    })
    .await;
    let client = connected(addr).await;
    let mut disconnects = client.listener("disconnect");

    timeout(TIMEOUT, server.close(Some(handle))).await.unwrap();
    assert_matches!(
        next(&mut disconnects).await,
        ClientEvent::Disconnect { code: close_codes::GOING_AWAY, .. }
    );
    assert_eq!(server.clients_count(), 0);
}

#[tokio::test]
async fn client_disconnect_unregisters_socket() {
    let (server, addr, _handle) = listen(ServerSettings::default()).await;
    let mut closures = server.listener("closure");
    let client = connected(addr).await;
    let id = client.id().unwrap();
    assert_eq!(server.clients_count(), 1);

    client.disconnect(close_codes::NORMAL, "done");
    let event = next(&mut closures).await;
    assert_eq!(event.socket_id(), Some(&id));
    assert_eq!(server.clients_count(), 0);
}
