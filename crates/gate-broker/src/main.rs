//! gate-broker binary — start the lock broker daemon.
//!
//! ```text
//! gate-broker --state-dir /var/lib/gate --socket /run/gate/broker.sock
//! gate-broker --state-dir /var/lib/gate --host 127.0.0.1 --port 8787
//! ```
//!
//! Defaults come from `GATE_*` environment variables (see `gate-core`);
//! command-line flags override both. Exit codes: 0 on clean shutdown, 2 when
//! the durable store cannot be opened, 3 when the listen socket cannot be
//! bound, 1 for other fatal errors.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gate_broker::broker::{LockBroker, SharedBroker};
use gate_broker::server::{self, Listener, Shutdown};
use gate_broker::sweep;
use gate_core::config::BrokerConfig;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const EXIT_STORE: u8 = 2;
const EXIT_BIND: u8 = 3;

/// gate-broker - FIFO lock broker for the Gate filesystem gateway
#[derive(Parser, Debug)]
#[command(name = "gate-broker")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory for the durable lock store
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Listen host (TCP mode)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (TCP mode)
    #[arg(long)]
    port: Option<u16>,

    /// Listen on a Unix domain socket instead of TCP
    #[arg(long, conflicts_with_all = ["host", "port"])]
    socket: Option<PathBuf>,

    /// Lease window in milliseconds for grants without an override
    #[arg(long)]
    lease_ms: Option<u64>,

    /// Absolute hold cap in milliseconds
    #[arg(long)]
    max_hold_ms: Option<u64>,

    /// Default acquire timeout in milliseconds
    #[arg(long)]
    acquire_timeout_ms: Option<u64>,

    /// Sweep cadence in milliseconds (default: lease / 4)
    #[arg(long)]
    sweep_interval_ms: Option<u64>,

    /// Audit log retention in hours
    #[arg(long)]
    audit_retention_hours: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    /// Flags override environment, environment overrides defaults.
    fn resolve(&self) -> BrokerConfig {
        let mut config = BrokerConfig::from_env();
        if let Some(state_dir) = &self.state_dir {
            config.state_dir.clone_from(state_dir);
        }
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config.socket.clone_from(&self.socket);
        if let Some(lease_ms) = self.lease_ms {
            config.lease_ms = lease_ms;
        }
        if let Some(max_hold_ms) = self.max_hold_ms {
            config.max_hold_ms = max_hold_ms;
        }
        if let Some(acquire_timeout_ms) = self.acquire_timeout_ms {
            config.acquire_timeout_ms = acquire_timeout_ms;
        }
        config.sweep_interval_ms = self.sweep_interval_ms;
        if let Some(audit_retention_hours) = self.audit_retention_hours {
            config.audit_retention_hours = audit_retention_hours;
        }
        config
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let config = args.resolve();

    let broker: SharedBroker = match LockBroker::open(&config) {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            error!("failed to open lock store: {e}");
            return ExitCode::from(EXIT_STORE);
        }
    };

    let listener = if let Some(socket) = &config.socket {
        Listener::bind_unix(socket)
    } else {
        Listener::bind_tcp(&config.host, config.port).await
    };
    let listener = match listener {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind: {e}");
            return ExitCode::from(EXIT_BIND);
        }
    };

    info!(
        state_dir = %config.state_dir.display(),
        lease_ms = config.lease_ms,
        max_hold_ms = config.max_hold_ms,
        acquire_timeout_ms = config.acquire_timeout_ms,
        "gate-broker started (pid: {})",
        std::process::id()
    );

    let shutdown = Shutdown::new();

    let sweep_task = tokio::spawn(sweep::run(
        broker.clone(),
        config.sweep_interval(),
        shutdown.clone(),
    ));

    let signal_shutdown = shutdown.clone();
    let signal_task = tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to register SIGTERM handler: {e}");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to register SIGINT handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        signal_shutdown.trigger();
    });

    let result = server::run(listener, broker, shutdown.clone()).await;

    shutdown.trigger();
    signal_task.abort();
    // The sweep never holds partial state across an await, so aborting
    // between ticks is safe.
    sweep_task.abort();
    let _ = sweep_task.await;

    match result {
        Ok(()) => {
            info!("gate-broker shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}
