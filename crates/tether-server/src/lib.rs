//! # tether-server
//!
//! Server end of tether, served over axum WebSockets.
//!
//! - [`Server`]: socket registry, origin check, broker fan-out, `/health`
//!   and `/metrics`, graceful shutdown
//! - [`ServerSocket`]: per-connection handshake, auth, channels, calls and
//!   keepalive
//! - [`MiddlewarePipeline`]: interceptors for every inbound action and every
//!   outbound publication
//! - [`Broker`]: channel membership and publication feed
//!   ([`MemoryBroker`] in-process)

#![deny(unsafe_code)]

pub mod broker;
pub mod events;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod server;
pub mod shutdown;
pub mod socket;
mod ws;

pub use broker::{Broker, BrokerPublication, MemoryBroker};
pub use events::{ServerEvent, ServerEventKind, SocketEvent};
pub use middleware::{
    ActionRequest, Middleware, MiddlewareError, MiddlewareKind, MiddlewarePipeline,
    PipelineOutcome, from_fn,
};
pub use server::{AppState, Server, ServerBuilder};
pub use shutdown::ShutdownCoordinator;
pub use socket::{HandshakeInfo, ServerSocket};
