//! Blocking broker client.
//!
//! Each operation opens a fresh connection, sends one framed request, reads
//! one framed response, and closes (stateless per exchange). The FUSE proxy
//! calls this from synchronous filesystem callbacks; the CLI uses it
//! directly.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{
    self, ErrorKind, LockMode, OwnerToken, ProtocolError, Request, Response, StatusSnapshot,
};

/// Extra read-timeout slack on top of a server-side acquire timeout, so the
/// broker's `timeout` answer wins the race against the socket deadline.
const ACQUIRE_TIMEOUT_GRACE: Duration = Duration::from_secs(10);

/// Default per-exchange timeout for operations that never block server-side.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the broker listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    /// Loopback TCP.
    Tcp {
        /// Host to connect to.
        host: String,
        /// Port to connect to.
        port: u16,
    },
    /// Unix domain socket (preferred).
    Unix(PathBuf),
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Nothing is listening at the endpoint.
    #[error("broker is not reachable at {endpoint}")]
    Unreachable {
        /// The endpoint that refused the connection.
        endpoint: String,
    },

    /// The connection failed mid-exchange.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Framing or serialization failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The broker reported an error response.
    #[error("broker error ({kind}): {message}")]
    Broker {
        /// Machine-readable failure class.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },

    /// The broker answered with a response that does not fit the request.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Parameters for an acquire call.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Canonical path key.
    pub path: String,
    /// Requested mode.
    pub mode: LockMode,
    /// Requesting owner.
    pub owner: OwnerToken,
    /// Client-side bound on the wait; broker default when `None`.
    pub timeout_ms: Option<u64>,
    /// Per-entry lease override.
    pub lease_ms: Option<u64>,
    /// Per-entry absolute-cap override.
    pub max_hold_ms: Option<u64>,
}

impl AcquireRequest {
    /// Acquire `path` in `mode` for `owner` with broker-default timings.
    pub fn new(path: impl Into<String>, mode: LockMode, owner: &OwnerToken) -> Self {
        Self {
            path: path.into(),
            mode,
            owner: owner.clone(),
            timeout_ms: None,
            lease_ms: None,
            max_hold_ms: None,
        }
    }

    /// Bound the wait to `timeout_ms`.
    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Override the lease window for this entry.
    #[must_use]
    pub fn lease_ms(mut self, lease_ms: u64) -> Self {
        self.lease_ms = Some(lease_ms);
        self
    }

    /// Override the absolute hold cap for this entry.
    #[must_use]
    pub fn max_hold_ms(mut self, max_hold_ms: u64) -> Self {
        self.max_hold_ms = Some(max_hold_ms);
        self
    }
}

/// Result of an acquire call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lock is held.
    Granted,
    /// The wait elapsed; the entry was removed from the queue.
    Timeout,
}

/// Result of a release call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// One hold was dropped (the entry may still be held re-entrantly).
    Released,
    /// No granted entry matched; the lock was lost or never held.
    NotHeld,
}

/// Result of a heartbeat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The lease was refreshed.
    Ok,
    /// No granted entry matched.
    NotHeld,
    /// The sweep reclaimed the entry; the lock is gone.
    Expired,
}

/// Blocking broker client.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    endpoint: BrokerEndpoint,
    op_timeout: Duration,
}

enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Conn {
    fn set_timeouts(&self, timeout: Duration) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))
            }
            Self::Unix(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))
            }
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

impl BrokerClient {
    /// Create a client with the default per-exchange timeout.
    #[must_use]
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Override the per-exchange timeout for non-blocking operations.
    #[must_use]
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// The configured endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Acquire a lock, blocking until grant or timeout.
    ///
    /// # Errors
    ///
    /// [`ClientError::Unreachable`] when nothing listens at the endpoint,
    /// transport/protocol errors mid-exchange, and [`ClientError::Broker`]
    /// when the broker reports a failure (e.g. `store_failure`).
    pub fn acquire(&self, req: &AcquireRequest) -> Result<AcquireOutcome, ClientError> {
        // The read deadline must outlast the broker-side wait.
        let wait = req
            .timeout_ms
            .map_or(self.op_timeout, Duration::from_millis);
        // Bounded so the socket timeout stays representable on every platform.
        let exchange_timeout = wait
            .saturating_add(ACQUIRE_TIMEOUT_GRACE)
            .min(Duration::from_secs(86_400));

        let wire = Request::Acquire {
            path: req.path.clone(),
            mode: req.mode,
            owner: req.owner.clone(),
            request_id: protocol::new_request_id(),
            timeout_ms: req.timeout_ms,
            lease_ms: req.lease_ms,
            max_hold_ms: req.max_hold_ms,
        };
        match self.exchange(&wire, exchange_timeout)? {
            Response::Granted => Ok(AcquireOutcome::Granted),
            Response::Timeout => Ok(AcquireOutcome::Timeout),
            other => Err(unexpected(&other)),
        }
    }

    /// Drop one hold on a granted lock.
    ///
    /// # Errors
    ///
    /// Same classes as [`BrokerClient::acquire`].
    pub fn release(&self, path: &str, owner: &OwnerToken) -> Result<ReleaseOutcome, ClientError> {
        let wire = Request::Release {
            path: path.to_string(),
            owner: owner.clone(),
        };
        match self.exchange(&wire, self.op_timeout)? {
            Response::Ok => Ok(ReleaseOutcome::Released),
            Response::NotHeld => Ok(ReleaseOutcome::NotHeld),
            other => Err(unexpected(&other)),
        }
    }

    /// Refresh the lease on a granted lock.
    ///
    /// # Errors
    ///
    /// Same classes as [`BrokerClient::acquire`].
    pub fn heartbeat(&self, path: &str, owner: &OwnerToken) -> Result<HeartbeatOutcome, ClientError> {
        let wire = Request::Heartbeat {
            path: path.to_string(),
            owner: owner.clone(),
        };
        match self.exchange(&wire, self.op_timeout)? {
            Response::Ok => Ok(HeartbeatOutcome::Ok),
            Response::NotHeld => Ok(HeartbeatOutcome::NotHeld),
            Response::Expired => Ok(HeartbeatOutcome::Expired),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetch a queue snapshot, optionally restricted to one path.
    ///
    /// # Errors
    ///
    /// Same classes as [`BrokerClient::acquire`].
    pub fn status(&self, path: Option<&str>) -> Result<StatusSnapshot, ClientError> {
        let wire = Request::Status {
            path: path.map(ToString::to_string),
        };
        match self.exchange(&wire, self.op_timeout)? {
            Response::Snapshot { snapshot } => Ok(snapshot),
            other => Err(unexpected(&other)),
        }
    }

    fn connect(&self) -> Result<Conn, ClientError> {
        let conn = match &self.endpoint {
            BrokerEndpoint::Tcp { host, port } => {
                TcpStream::connect((host.as_str(), *port)).map(Conn::Tcp)
            }
            BrokerEndpoint::Unix(path) => UnixStream::connect(path).map(Conn::Unix),
        };
        conn.map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) {
                ClientError::Unreachable {
                    endpoint: self.endpoint.to_string(),
                }
            } else {
                ClientError::Transport(e)
            }
        })
    }

    fn exchange(&self, req: &Request, timeout: Duration) -> Result<Response, ClientError> {
        let mut conn = self.connect()?;
        conn.set_timeouts(timeout)?;
        protocol::write_message(&mut conn, req)?;
        let resp: Response = protocol::read_message(&mut conn)?;
        if let Response::Error {
            error_kind,
            message,
        } = resp
        {
            return Err(ClientError::Broker {
                kind: error_kind,
                message,
            });
        }
        Ok(resp)
    }
}

fn unexpected(resp: &Response) -> ClientError {
    ClientError::UnexpectedResponse(format!("{resp:?}"))
}
