//! # tether-auth
//!
//! Auth token signing and verification.
//!
//! - [`AuthEngine`]: the signer/verifier seam the server talks to
//! - [`JwtAuthEngine`]: HMAC-SHA256 JSON Web Tokens via `jsonwebtoken`
//! - [`decode_unverified`]: read a token's claims without checking its
//!   signature (clients use this to expose the claims they were issued)

#![deny(unsafe_code)]

pub mod decode;
pub mod engine;
pub mod jwt;

pub use decode::decode_unverified;
pub use engine::{AuthEngine, SignOptions};
pub use jwt::{JwtAuthEngine, generate_key};
