//! gate-mount binary — mount a broker-gated view of a directory tree.
//!
//! ```text
//! gate-mount --root /srv/repo --mount /mnt/repo --broker-host 127.0.0.1 --broker-port 8787
//! gate-mount --root /srv/repo --mount /mnt/repo --broker-socket /run/gate/broker.sock --foreground
//! ```
//!
//! Without `--foreground` the process daemonizes with the classic double
//! fork. The fork MUST precede the FUSE session and the heartbeat thread:
//! forking a process that already spawned threads leaves mutexes locked
//! forever in the child. `main` therefore daemonizes first, then starts
//! logging, the heartbeat thread, and the mount loop.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fuser::MountOption;
use gate_core::client::{BrokerClient, BrokerEndpoint};
use gate_core::config::{self, BrokerConfig};
use gate_mount::{GateFs, HeartbeatTask, ProxyConfig};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// gate-mount - broker-gated FUSE mount
#[derive(Parser, Debug)]
#[command(name = "gate-mount")]
#[command(version, about, long_about = None)]
struct Args {
    /// Backing directory tree to mirror
    #[arg(long)]
    root: PathBuf,

    /// Mount point
    #[arg(long)]
    mount: PathBuf,

    /// Broker host (TCP mode)
    #[arg(long)]
    broker_host: Option<String>,

    /// Broker port (TCP mode)
    #[arg(long)]
    broker_port: Option<u16>,

    /// Broker Unix socket (preferred over TCP when set)
    #[arg(long, conflicts_with_all = ["broker_host", "broker_port"])]
    broker_socket: Option<PathBuf>,

    /// Stay in the foreground instead of daemonizing
    #[arg(long)]
    foreground: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Lease window requested for every lock, in milliseconds
    #[arg(long)]
    lease_ms: Option<u64>,

    /// Acquire timeout in milliseconds
    #[arg(long)]
    acquire_timeout_ms: Option<u64>,

    /// Absolute hold cap forwarded to the broker, in milliseconds
    #[arg(long)]
    max_hold_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Double-fork daemonization. Must run before any thread exists.
fn daemonize() -> std::io::Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    fn errno_io(e: nix::errno::Errno) -> std::io::Error {
        std::io::Error::from_raw_os_error(e as i32)
    }

    // SAFETY: called from a single-threaded context, before the heartbeat
    // thread and the FUSE session are started. The parent exits immediately.
    match unsafe { fork() }.map_err(errno_io)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().map_err(errno_io)?;

    // SAFETY: still single-threaded; this second fork prevents the daemon
    // from ever reacquiring a controlling terminal.
    match unsafe { fork() }.map_err(errno_io)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    std::env::set_current_dir("/")?;
    Ok(())
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

fn endpoint(args: &Args, defaults: &BrokerConfig) -> BrokerEndpoint {
    if let Some(socket) = &args.broker_socket {
        return BrokerEndpoint::Unix(socket.clone());
    }
    BrokerEndpoint::Tcp {
        host: args
            .broker_host
            .clone()
            .unwrap_or_else(|| defaults.host.clone()),
        port: args.broker_port.unwrap_or(defaults.port),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Daemonize before anything spawns a thread.
    if !args.foreground {
        if let Err(e) = daemonize() {
            eprintln!("daemonization failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = init_logging(&args) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let defaults = BrokerConfig::from_env();
    let endpoint = endpoint(&args, &defaults);
    let client = BrokerClient::new(endpoint.clone());

    let proxy_config = ProxyConfig {
        lease_ms: args.lease_ms.unwrap_or(defaults.lease_ms),
        acquire_timeout_ms: args
            .acquire_timeout_ms
            .unwrap_or(defaults.acquire_timeout_ms),
        max_hold_ms: args.max_hold_ms,
        release_on_flush: config::release_on_flush_from_env(),
    };
    let lease_ms = proxy_config.lease_ms;
    let release_on_flush = proxy_config.release_on_flush;

    let fs = match GateFs::new(&args.root, client.clone(), proxy_config) {
        Ok(fs) => fs,
        Err(e) => {
            error!("failed to open backing root {}: {e}", args.root.display());
            return ExitCode::FAILURE;
        }
    };

    let heartbeat = HeartbeatTask::spawn(
        client,
        fs.handles(),
        config::heartbeat_interval(lease_ms),
    );

    let mut options = vec![
        MountOption::FSName("gate".to_string()),
        MountOption::DefaultPermissions,
    ];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }

    info!(
        root = %args.root.display(),
        mount = %args.mount.display(),
        broker = %endpoint,
        lease_ms,
        release_on_flush,
        "gate-mount started (pid: {})",
        std::process::id()
    );

    let result = fuser::mount2(fs, &args.mount, &options);
    heartbeat.shutdown();

    match result {
        Ok(()) => {
            info!("gate-mount unmounted");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("mount failed: {e}");
            ExitCode::FAILURE
        }
    }
}
