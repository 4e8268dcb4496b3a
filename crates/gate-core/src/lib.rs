//! # gate-core
//!
//! Core library for Gate, a brokered filesystem gateway that serializes
//! concurrent access to the files under a mount point.
//!
//! This crate holds everything shared between the lock broker daemon, the
//! FUSE proxy, and the operator CLI:
//!
//! - [`protocol`]: the wire schema (acquire/release/heartbeat/status) and
//!   length-prefixed JSON framing helpers
//! - [`config`]: defaults and `GATE_*` environment overrides
//! - [`client`]: a blocking broker client over Unix or loopback TCP sockets
//!
//! ## Example
//!
//! ```rust,no_run
//! use gate_core::client::{AcquireRequest, BrokerClient, BrokerEndpoint};
//! use gate_core::protocol::{LockMode, OwnerToken};
//!
//! let client = BrokerClient::new(BrokerEndpoint::Tcp {
//!     host: "127.0.0.1".to_string(),
//!     port: 8787,
//! });
//! let owner = OwnerToken::mint();
//! let outcome = client.acquire(&AcquireRequest::new("/repo/src/main.rs", LockMode::Write, &owner));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod config;
pub mod protocol;

pub use client::{BrokerClient, BrokerEndpoint, ClientError};
pub use config::BrokerConfig;
pub use protocol::{ErrorKind, LockMode, OwnerToken, Request, Response};
