//! Transport-neutral text-frame pipe.
//!
//! Every transport (a tungstenite client stream, an axum server socket, an
//! in-memory pair) is adapted into a [`Link`]: a sender for outbound
//! [`Frame`]s and a receiver for inbound ones. An inbound
//! [`Frame::Close`] means the peer closed; the receiver ending without one
//! means the transport hung up.

use tokio::sync::mpsc;

use crate::close_codes;
use crate::errors::TransportError;

/// One unit of transport traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A text frame.
    Text(String),
    /// A close frame.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

impl Frame {
    /// The frame a session synthesizes when its transport vanishes.
    pub fn hung_up() -> Self {
        Self::Close {
            code: close_codes::ABNORMAL,
            reason: close_codes::describe(close_codes::ABNORMAL).to_string(),
        }
    }
}

/// Outbound half of a [`Link`].
#[derive(Clone, Debug)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl LinkSender {
    /// Wrap a raw frame sender.
    pub fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { tx }
    }

    /// Queue a text frame.
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(Frame::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a close frame. Frames queued after it are never delivered.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Frame::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Whether the transport side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A bidirectional frame pipe to one peer.
#[derive(Debug)]
pub struct Link {
    /// Outbound frames.
    pub sender: LinkSender,
    /// Inbound frames.
    pub receiver: mpsc::UnboundedReceiver<Frame>,
}

impl Link {
    /// Two links wired back to back, for in-process transports and tests.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: LinkSender::new(a_tx),
                receiver: a_rx,
            },
            Self {
                sender: LinkSender::new(b_tx),
                receiver: b_rx,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_is_cross_wired() {
        let (mut a, mut b) = Link::pair();
        a.sender.send_text("ping".into()).unwrap();
        b.sender.send_text("pong".into()).unwrap();
        assert_eq!(b.receiver.recv().await, Some(Frame::Text("ping".into())));
        assert_eq!(a.receiver.recv().await, Some(Frame::Text("pong".into())));
    }

    #[tokio::test]
    async fn close_frame_reaches_peer() {
        let (a, mut b) = Link::pair();
        a.sender.close(4000, "bye");
        assert_eq!(
            b.receiver.recv().await,
            Some(Frame::Close {
                code: 4000,
                reason: "bye".into()
            })
        );
    }

    #[tokio::test]
    async fn dropped_peer_ends_receiver() {
        let (a, mut b) = Link::pair();
        drop(a);
        assert_eq!(b.receiver.recv().await, None);
        assert!(b.sender.is_closed());
        assert!(b.sender.send_text("x".into()).is_err());
    }

    #[test]
    fn hung_up_is_abnormal() {
        let Frame::Close { code, reason } = Frame::hung_up() else {
            panic!("expected close");
        };
        assert_eq!(code, 1006);
        assert_eq!(reason, "Socket hung up");
    }
}
