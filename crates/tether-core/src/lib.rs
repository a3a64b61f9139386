//! # tether-core
//!
//! Shared vocabulary for both ends of a tether connection.
//!
//! - **Envelopes**: [`envelope::Envelope`] and the [`envelope::Action`] enum that
//!   reserved `#`-prefixed events are parsed into
//! - **Codec**: [`codec::Codec`] trait with the default [`codec::JsonCodec`]
//! - **Streams**: [`stream::MultiplexedStream`], a shared append-only log read by
//!   many independent named readers
//! - **Calls**: [`correlator::CallCorrelator`], the outstanding-call table that
//!   matches responses to invokes
//! - **Transport**: [`link::Link`] and [`link::Frame`], the text-frame pipe every
//!   transport is adapted into
//! - **Errors**: protocol error hierarchy via `thiserror`, [`errors::WireError`]
//!   for errors that cross the wire
//! - **Close codes**: the catalogue of connection close codes and their meaning

#![deny(unsafe_code)]

pub mod backoff;
pub mod close_codes;
pub mod codec;
pub mod correlator;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod keepalive;
pub mod link;
pub mod logging;
pub mod procedure;
pub mod state;
pub mod stream;
