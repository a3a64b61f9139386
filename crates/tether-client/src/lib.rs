//! # tether-client
//!
//! Client end of a tether connection.
//!
//! - [`Client`]: connect/handshake/auth lifecycle, reconnect with backoff,
//!   ping watchdog, FIFO outbound buffer, transmit/invoke, channels
//! - [`ChannelRegistry`]: per-connection subscription state machine
//! - [`Connector`]: how a [`tether_core::link::Link`] is obtained
//!   ([`WsConnector`] over tokio-tungstenite, [`MemoryConnector`] in-process)
//! - [`TokenStore`]: where the signed auth token lives between connections

#![deny(unsafe_code)]

pub mod channel;
pub mod client;
pub mod connector;
pub mod events;
pub mod token_store;

pub use channel::{ChannelRegistry, ChannelState, SubscribeOptions};
pub use client::{AckTimeout, Client, ClientBuilder, EmitOptions};
pub use connector::{Connector, MemoryConnector, WsConnector};
pub use events::ClientEvent;
pub use token_store::{FileTokenStore, MemoryTokenStore, TokenStore, TokenStoreError};
