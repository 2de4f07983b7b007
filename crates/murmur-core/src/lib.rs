//! # Murmur Core Library
//!
//! The server-side core of a decentralized, end-to-end encrypted messaging
//! overlay. Each node authenticates clients, stores encrypted envelopes,
//! exchanges them with peers over a peer-to-peer network, and relays traffic
//! through onion-style circuits while continuously selecting the best
//! transport.
//!
//! ## Security Model
//!
//! - The server never sees message plaintext: payloads are encrypted
//!   end-to-end with a Double Ratchet session held by the clients.
//! - Passwords never reach the server in the clear: registration and login
//!   use an SRP-6a exchange plus an Argon2id-derived verifier.
//! - Every stored envelope carries an Ed25519 signature that is verified
//!   against the sender's registered key before it is accepted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 node services                │
//! ├──────────┬───────────┬───────────┬───────────┤
//! │   auth   │ messaging │  groups   │  storage  │
//! ├──────────┴───────────┴───────────┴───────────┤
//! │      net (streams · discovery · relay ·      │
//! │            adaptive router)                  │
//! ├──────────────────────────────────────────────┤
//! │        crypto (aead · ratchet · srp)         │
//! └──────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod groups;
pub mod logging;
pub mod messaging;
pub mod net;
pub mod storage;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum peer-stream frame size in bytes (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum number of skipped message keys stored per chain jump
pub const MAX_SKIP: u32 = 100;
