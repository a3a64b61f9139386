//! How a client obtains its [`Link`].

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tether_core::close_codes;
use tether_core::errors::TransportError;
use tether_core::link::{Frame, Link, LinkSender};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, instrument};

/// Opens a transport to `uri` and adapts it into a [`Link`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new link.
    async fn connect(&self, uri: &str) -> Result<Link, TransportError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket transport over tokio-tungstenite.
///
/// Two pump tasks bridge the socket: the writer drains outbound frames (a
/// close frame ends it), the reader forwards text frames and synthesizes
/// [`Frame::hung_up`] when the socket ends without a close frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    #[instrument(skip(self))]
    async fn connect(&self, uri: &str) -> Result<Link, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(uri)
            .await
            .map_err(|e| TransportError::Connect {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        let _writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    Frame::Text(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Frame::Close { code, reason } => {
                        let close = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(close))).await;
                        break;
                    }
                }
            }
            let _ = ws_tx.close().await;
        });

        let _reader = tokio::spawn(async move {
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
                            |f| (u16::from(f.code), f.reason.as_str().to_owned()),
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

        Ok(Link {
            sender: LinkSender::new(out_tx),
            receiver: in_rx,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

const MODE_ACCEPT: u8 = 0;
const MODE_REFUSE: u8 = 1;
const MODE_STALL: u8 = 2;

/// In-process transport. Every successful connect hands the peer end of a
/// [`Link::pair`] to the receiver returned by [`MemoryConnector::new`].
#[derive(Debug)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<Link>,
    mode: AtomicU8,
}

impl MemoryConnector {
    /// Connector plus the receiver of server-side link ends.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Link>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                mode: AtomicU8::new(MODE_ACCEPT),
            },
            rx,
        )
    }

    /// Make subsequent connects fail immediately.
    pub fn refuse(&self) {
        self.mode.store(MODE_REFUSE, Ordering::Release);
    }

    /// Make subsequent connects never complete.
    pub fn stall(&self) {
        self.mode.store(MODE_STALL, Ordering::Release);
    }

    /// Make subsequent connects succeed.
    pub fn accept(&self) {
        self.mode.store(MODE_ACCEPT, Ordering::Release);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, uri: &str) -> Result<Link, TransportError> {
        match self.mode.load(Ordering::Acquire) {
            MODE_REFUSE => {
                return Err(TransportError::Connect {
                    uri: uri.to_string(),
                    reason: "connection refused".into(),
                });
            }
            MODE_STALL => futures::future::pending::<()>().await,
            _ => {}
        }
        let (client, server) = Link::pair();
        self.peers.send(server).map_err(|_| TransportError::Connect {
            uri: uri.to_string(),
            reason: "no listener".into(),
        })?;
        Ok(client)
    }
}
