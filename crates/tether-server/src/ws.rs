//! WebSocket upgrade handler and the pumps bridging an axum socket to a
//! [`Link`].

use std::net::SocketAddr;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tether_core::close_codes;
use tether_core::link::{Frame, Link, LinkSender};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::server::AppState;
use crate::socket::HandshakeInfo;

/// GET on the configured path: upgrade and hand the connection to the server.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let info = HandshakeInfo {
        remote_addr: Some(addr),
        origin,
    };
    debug!(%addr, origin = ?info.origin, "websocket upgrade");
    ws.on_upgrade(move |socket| async move {
        let server = state.server;
        let (link, pumps) = bridge(socket);
        for pump in pumps {
            server.track(pump);
        }
        let _ = server.accept(link, info).await;
    })
}

/// Split `socket` into a [`Link`] plus its writer and reader pump tasks.
///
/// The writer drains outbound frames until a close frame; the reader
/// forwards text frames and reports [`Frame::hung_up`] when the socket ends
/// without a close frame.
fn bridge(socket: WebSocket) -> (Link, [JoinHandle<()>; 2]) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                Frame::Text(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Frame::Close { code, reason } => {
                    let close = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close))).await;
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            let frame = match msg {
                Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => Frame::Text(text.to_owned()),
                    Err(_) => {
                        debug!(len = data.len(), "dropping non-UTF8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(close)) => {
                    let (code, reason) = close.map_or_else(
                        || (close_codes::NO_STATUS, String::new()),
                        |f| (f.code, f.reason.as_str().to_owned()),
                    );
                    let _ = in_tx.send(Frame::Close { code, reason });
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "websocket read failed");
                    break;
                }
            };
            if in_tx.send(frame).is_err() {
                return;
            }
        }
        let _ = in_tx.send(Frame::hung_up());
    });

    let link = Link {
        sender: LinkSender::new(out_tx),
        receiver: in_rx,
    };
    (link, [writer, reader])
}
