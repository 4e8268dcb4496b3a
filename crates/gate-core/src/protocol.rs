//! Wire protocol between the broker and its clients.
//!
//! Requests and responses are JSON documents exchanged over a Unix domain
//! socket or loopback TCP connection, framed with a 4-byte big-endian length
//! prefix:
//!
//! ```text
//! +----------------------+------------------+
//! | Length (4 bytes, BE) | JSON payload     |
//! +----------------------+------------------+
//! ```
//!
//! The frame length is validated against [`MAX_FRAME_SIZE`] before any
//! allocation occurs, so a malformed peer cannot force a large allocation.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum frame size (1 MiB). Status snapshots are the only responses that
/// grow with state, and a snapshot that large indicates a runaway queue.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Errors arising from framing or (de)serialization.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame length prefix exceeded [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// The peer closed the connection mid-frame.
    #[error("connection closed before a complete frame was read")]
    UnexpectedEof,

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload was not valid JSON for the expected message type.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lock mode requested against a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Shared access; any number of readers may hold the path together.
    Read,
    /// Exclusive access; a writer holds the path alone.
    Write,
}

impl LockMode {
    /// Whether a grant of `self` already satisfies a request for `requested`.
    ///
    /// `write` covers both modes; `read` covers only `read`. Re-entrant
    /// acquires rely on this: an owner holding `write` may re-enter with
    /// either mode, but a `read` holder asking for `write` is a lock upgrade
    /// and is queued as a fresh request instead.
    #[must_use]
    pub fn covers(self, requested: Self) -> bool {
        self == Self::Write || requested == Self::Read
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Opaque identifier grouping re-entrant acquires from one logical holder.
///
/// The broker never introspects tokens; the proxy decides when to mint a
/// fresh one (each new open) and when to reuse one (metadata operations on a
/// path with an open handle).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Mint a fresh random token.
    #[must_use]
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// View the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OwnerToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mint a request correlation id. Logged and audited by the broker; grant
/// ordering uses the broker's own sequence, never this id.
#[must_use]
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A request sent by a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Acquire (or re-enter) a lock on `path`.
    Acquire {
        /// Canonical path key.
        path: String,
        /// Requested mode.
        mode: LockMode,
        /// Requesting owner.
        owner: OwnerToken,
        /// Correlation id for logs and the audit trail.
        request_id: String,
        /// How long the broker may block this request before answering
        /// `timeout`. Falls back to the broker default when absent; waits are
        /// always finite.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        /// Per-entry lease override.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lease_ms: Option<u64>,
        /// Per-entry absolute-cap override.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_hold_ms: Option<u64>,
    },

    /// Drop one hold on a granted entry.
    Release {
        /// Path key of the held lock.
        path: String,
        /// Holder releasing it.
        owner: OwnerToken,
    },

    /// Refresh the lease on a granted entry.
    Heartbeat {
        /// Path key of the held lock.
        path: String,
        /// Holder heartbeating.
        owner: OwnerToken,
    },

    /// Fetch a snapshot of queue state.
    Status {
        /// Restrict the snapshot to one path.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

/// Error kinds a client must be able to distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Acquire did not succeed within the client's timeout.
    QueueTimeout,
    /// Release or heartbeat referenced an owner/path with no granted entry.
    NotHeld,
    /// The sweep reclaimed the entry after its lease lapsed.
    LeaseExpired,
    /// The sweep reclaimed the entry at the absolute hold cap.
    ForceExpired,
    /// The broker could not be reached at all.
    BrokerUnreachable,
    /// The connection failed mid-exchange.
    Transport,
    /// The durable store rejected the transition; broker state is unchanged.
    StoreFailure,
    /// The backing filesystem operation failed under lock.
    BackingIo,
    /// The request was structurally invalid.
    InvalidRequest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QueueTimeout => "queue_timeout",
            Self::NotHeld => "not_held",
            Self::LeaseExpired => "lease_expired",
            Self::ForceExpired => "force_expired",
            Self::BrokerUnreachable => "broker_unreachable",
            Self::Transport => "transport_error",
            Self::StoreFailure => "store_failure",
            Self::BackingIo => "backing_io_error",
            Self::InvalidRequest => "invalid_request",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a queue entry, as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Enqueued, not yet grantable.
    Waiting,
    /// Part of the granted prefix.
    Granted,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Granted => write!(f, "granted"),
        }
    }
}

/// One queue entry in a status snapshot. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    /// Correlation id supplied at acquire time.
    pub request_id: String,
    /// Holding or waiting owner.
    pub owner: OwnerToken,
    /// Requested mode.
    pub mode: LockMode,
    /// Waiting or granted.
    pub state: EntryState,
    /// Re-entrant hold count (1 for waiting entries).
    pub hold_count: u32,
    /// When the entry was enqueued.
    pub enqueued_at_ms: u64,
    /// When the entry was granted, if it has been.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_at_ms: Option<u64>,
    /// When the lease lapses absent a heartbeat, if granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at_ms: Option<u64>,
}

/// Full queue snapshot keyed by path, in queue order per path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Queue contents per path.
    pub paths: BTreeMap<String, Vec<EntrySnapshot>>,
}

/// A response from the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The lock is held by the requesting owner (fresh or re-entrant grant).
    Granted,
    /// The request was enqueued without blocking (non-blocking variant).
    Queued,
    /// The acquire timed out; the waiting entry was removed.
    Timeout,
    /// Release or heartbeat succeeded.
    Ok,
    /// No granted entry matched the owner/path.
    NotHeld,
    /// The entry existed but the sweep already reclaimed it.
    Expired,
    /// Status snapshot payload.
    Snapshot {
        /// The queue contents.
        snapshot: StatusSnapshot,
    },
    /// The operation failed; `error_kind` says how.
    Error {
        /// Machine-readable failure class.
        error_kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
}

/// Prefix `payload` with its big-endian length.
#[must_use]
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(HEADER_LEN + payload.len());
    #[allow(clippy::cast_possible_truncation)] // callers respect MAX_FRAME_SIZE
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Parse and validate a frame length prefix.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] when the declared length exceeds
/// [`MAX_FRAME_SIZE`].
pub fn parse_frame_length(header: [u8; 4]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len)
}

/// Serialize `msg` and write it as one frame.
///
/// # Errors
///
/// Returns an error when serialization fails, the message exceeds
/// [`MAX_FRAME_SIZE`], or the write fails.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&frame_message(&payload))?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and deserialize it as `T`.
///
/// # Errors
///
/// Returns [`ProtocolError::UnexpectedEof`] when the peer closes before a
/// complete frame arrives, and the usual framing/JSON errors otherwise.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, ProtocolError> {
    let mut header = [0u8; 4];
    read_exact_or_eof(reader, &mut header)?;
    let len = parse_frame_length(header)?;
    let mut payload = vec![0u8; len];
    read_exact_or_eof(reader, &mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof
        } else {
            ProtocolError::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn mode_covering() {
        assert!(LockMode::Write.covers(LockMode::Write));
        assert!(LockMode::Write.covers(LockMode::Read));
        assert!(LockMode::Read.covers(LockMode::Read));
        assert!(!LockMode::Read.covers(LockMode::Write));
    }

    #[test]
    fn minted_tokens_are_unique() {
        assert_ne!(OwnerToken::mint(), OwnerToken::mint());
    }

    #[test]
    fn acquire_request_wire_shape() {
        let req = Request::Acquire {
            path: "/repo/a.txt".to_string(),
            mode: LockMode::Write,
            owner: OwnerToken::from("owner-1"),
            request_id: "req-1".to_string(),
            timeout_ms: Some(5000),
            lease_ms: None,
            max_hold_ms: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["op"], "acquire");
        assert_eq!(json["mode"], "write");
        assert_eq!(json["timeout_ms"], 5000);
        assert!(json.get("lease_ms").is_none());

        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn error_response_wire_shape() {
        let resp = Response::Error {
            error_kind: ErrorKind::StoreFailure,
            message: "disk full".to_string(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error_kind"], "store_failure");
    }

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        let req = Request::Heartbeat {
            path: "/f".to_string(),
            owner: OwnerToken::from("o"),
        };
        write_message(&mut buf, &req).unwrap();
        let len_bytes = u32::try_from(buf.len() - 4).unwrap().to_be_bytes();
        assert_eq!(&buf[..4], &len_bytes[..]);

        let mut cursor = Cursor::new(buf);
        let back: Request = read_message(&mut cursor).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn oversized_length_prefix_rejected_before_allocation() {
        let header = u32::try_from(MAX_FRAME_SIZE + 1).unwrap().to_be_bytes();
        assert!(matches!(
            parse_frame_length(header),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_frame_is_eof() {
        // Header promises 10 bytes, only 3 follow.
        let mut data = frame_message(&[1, 2, 3]);
        data[3] = 10;
        let mut cursor = Cursor::new(data);
        let result: Result<Request, _> = read_message(&mut cursor);
        assert!(matches!(result, Err(ProtocolError::UnexpectedEof)));
    }
}
