//! gate-broker — the FIFO lock broker daemon.
//!
//! Arbitrates read/write access to paths for the Gate filesystem gateway.
//! Per path, requests queue in strict arrival order: the granted prefix is a
//! single writer or a run of readers, later readers never overtake a queued
//! writer, and grants carry leases that the expiry sweep reclaims when
//! heartbeats stop.
//!
//! # Modules
//!
//! - [`broker`]: the arbiter — acquire/release/heartbeat/status transitions
//! - [`queue`]: per-path FIFO state and grant evaluation (pure)
//! - [`store`]: durable SQLite mirror of the queues plus the audit log
//! - [`sweep`]: background lease/cap reclaim task
//! - [`server`]: UDS/TCP accept loop and request dispatch
//! - [`framing`]: length-prefixed frame codec
//! - [`audit`]: audit trail event classes

pub mod audit;
pub mod broker;
pub mod framing;
pub mod queue;
pub mod server;
pub mod store;
pub mod sweep;

pub use broker::{AcquireParams, AcquireReply, HeartbeatReply, LockBroker, ReleaseReply};
pub use server::{Listener, Shutdown};
pub use store::{Store, StoreError};
