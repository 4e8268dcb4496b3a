//! Socket server: accept loop, per-connection tasks, request dispatch.
//!
//! Listens on a Unix domain socket (preferred) or loopback TCP. Each
//! connection is a framed JSON request/response stream; a connection may
//! issue any number of requests sequentially. Acquire requests block their
//! connection task, never the accept loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use gate_core::protocol::{ErrorKind, Request, Response};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::broker::{AcquireParams, AcquireReply, HeartbeatReply, ReleaseReply, SharedBroker};
use crate::framing::FrameCodec;

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Server startup failures, distinguished for exit codes.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen socket could not be bound.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        /// Human-readable endpoint.
        endpoint: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Accept-loop I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shutdown flag shared between the server, sweep task, and signal handler.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
}

impl Shutdown {
    /// Fresh, un-triggered flag.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request shutdown.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Where the server listens.
pub enum Listener {
    /// Unix domain socket plus its path, for cleanup.
    Unix(UnixListener, PathBuf),
    /// Loopback TCP.
    Tcp(TcpListener),
}

impl Listener {
    /// Bind a Unix socket, removing a stale socket file first.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the path cannot be prepared or
    /// bound.
    pub fn bind_unix(socket_path: &Path) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            endpoint: socket_path.display().to_string(),
            source,
        };
        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(bind_err)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }
        let listener = UnixListener::bind(socket_path).map_err(bind_err)?;
        info!(socket = %socket_path.display(), "broker listening");
        Ok(Self::Unix(listener, socket_path.to_path_buf()))
    }

    /// Bind a TCP listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the address cannot be bound.
    pub async fn bind_tcp(host: &str, port: u16) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind((host, port))
                .await
                .map_err(|source| ServerError::Bind {
                    endpoint: format!("{host}:{port}"),
                    source,
                })?;
        info!(host, port, "broker listening");
        Ok(Self::Tcp(listener))
    }
}

/// Run the accept loop until `shutdown` triggers.
///
/// # Errors
///
/// Returns an error only on unrecoverable accept-loop failures; individual
/// connection errors are logged and dropped.
pub async fn run(
    listener: Listener,
    broker: SharedBroker,
    shutdown: Arc<Shutdown>,
) -> Result<(), ServerError> {
    match &listener {
        Listener::Unix(l, _) => accept_loop_unix(l, &broker, &shutdown).await,
        Listener::Tcp(l) => accept_loop_tcp(l, &broker, &shutdown).await,
    }

    if let Listener::Unix(_, path) = &listener {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(socket = %path.display(), "failed to remove socket file: {e}");
            }
        }
    }
    info!("broker server stopped");
    Ok(())
}

async fn accept_loop_unix(listener: &UnixListener, broker: &SharedBroker, shutdown: &Arc<Shutdown>) {
    loop {
        if shutdown.is_triggered() {
            break;
        }
        match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, _addr))) => spawn_connection(stream, broker.clone()),
            Ok(Err(e)) => error!("accept failed: {e}"),
            Err(_) => {} // poll timeout; re-check shutdown
        }
    }
}

async fn accept_loop_tcp(listener: &TcpListener, broker: &SharedBroker, shutdown: &Arc<Shutdown>) {
    loop {
        if shutdown.is_triggered() {
            break;
        }
        match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, _addr))) => spawn_connection(stream, broker.clone()),
            Ok(Err(e)) => error!("accept failed: {e}"),
            Err(_) => {}
        }
    }
}

fn spawn_connection<S>(stream: S, broker: SharedBroker)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, broker).await {
            debug!("connection ended with error: {e}");
        }
    });
}

async fn handle_connection<S>(stream: S, broker: SharedBroker) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut framed = Framed::new(stream, FrameCodec);

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("frame read error: {e}");
                break;
            }
        };

        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => dispatch(request, &broker).await,
            Err(e) => Response::Error {
                error_kind: ErrorKind::InvalidRequest,
                message: format!("malformed request: {e}"),
            },
        };

        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to serialize response: {e}");
                break;
            }
        };
        if framed.send(Bytes::from(payload)).await.is_err() {
            break;
        }
    }

    Ok(())
}

/// Map one request to one broker call and its wire response.
pub async fn dispatch(request: Request, broker: &SharedBroker) -> Response {
    match request {
        Request::Acquire {
            path,
            mode,
            owner,
            request_id,
            timeout_ms,
            lease_ms,
            max_hold_ms,
        } => {
            if path.is_empty() {
                return Response::Error {
                    error_kind: ErrorKind::InvalidRequest,
                    message: "path must not be empty".to_string(),
                };
            }
            let result = broker
                .acquire(AcquireParams {
                    path,
                    mode,
                    owner,
                    request_id,
                    timeout_ms,
                    lease_ms,
                    max_hold_ms,
                })
                .await;
            match result {
                Ok(AcquireReply::Granted) => Response::Granted,
                Ok(AcquireReply::Timeout) => Response::Timeout,
                Err(e) => store_failure(&e),
            }
        }

        Request::Release { path, owner } => match broker.release(&path, &owner).await {
            Ok(ReleaseReply::Released) => Response::Ok,
            Ok(ReleaseReply::NotHeld) => Response::NotHeld,
            Err(e) => store_failure(&e),
        },

        Request::Heartbeat { path, owner } => match broker.heartbeat(&path, &owner).await {
            Ok(HeartbeatReply::Ok) => Response::Ok,
            Ok(HeartbeatReply::NotHeld) => Response::NotHeld,
            Ok(HeartbeatReply::Expired) => Response::Expired,
            Err(e) => store_failure(&e),
        },

        Request::Status { path } => Response::Snapshot {
            snapshot: broker.status(path.as_deref()).await,
        },
    }
}

fn store_failure(e: &crate::store::StoreError) -> Response {
    error!("store failure: {e}");
    Response::Error {
        error_kind: ErrorKind::StoreFailure,
        message: e.to_string(),
    }
}
