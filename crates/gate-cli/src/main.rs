//! gate - operator CLI for the Gate lock broker.
//!
//! ```text
//! gate status
//! gate status --path /srv/repo/src/main.rs
//! gate status --json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use gate_core::client::{BrokerClient, BrokerEndpoint, ClientError};
use gate_core::config::BrokerConfig;
use gate_core::protocol::StatusSnapshot;

/// gate - inspect the Gate lock broker
#[derive(Parser, Debug)]
#[command(name = "gate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Broker host (TCP mode)
    #[arg(long)]
    broker_host: Option<String>,

    /// Broker port (TCP mode)
    #[arg(long)]
    broker_port: Option<u16>,

    /// Broker Unix socket (preferred over TCP when set)
    #[arg(long, conflicts_with_all = ["broker_host", "broker_port"])]
    broker_socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show queue contents per path
    Status {
        /// Restrict to one path
        #[arg(long)]
        path: Option<String>,

        /// Emit raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn endpoint(cli: &Cli) -> BrokerEndpoint {
    if let Some(socket) = &cli.broker_socket {
        return BrokerEndpoint::Unix(socket.clone());
    }
    let defaults = BrokerConfig::from_env();
    BrokerEndpoint::Tcp {
        host: cli
            .broker_host
            .clone()
            .unwrap_or_else(|| defaults.host.clone()),
        port: cli.broker_port.unwrap_or(defaults.port),
    }
}

fn render_time(at_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(at_ms as i64)
        .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
}

fn print_table(snapshot: &StatusSnapshot) {
    if snapshot.paths.is_empty() {
        println!("no locks held or queued");
        return;
    }
    for (path, entries) in &snapshot.paths {
        println!("{path}");
        println!(
            "  {:<9} {:<6} {:<34} {:<5} {:<24} {}",
            "STATE", "MODE", "OWNER", "HOLDS", "ENQUEUED", "LEASE EXPIRES"
        );
        for entry in entries {
            println!(
                "  {:<9} {:<6} {:<34} {:<5} {:<24} {}",
                entry.state.to_string(),
                entry.mode.to_string(),
                entry.owner.to_string(),
                entry.hold_count,
                render_time(entry.enqueued_at_ms),
                entry
                    .lease_expires_at_ms
                    .map_or_else(|| "-".to_string(), render_time),
            );
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let client = BrokerClient::new(endpoint(cli));
    match &cli.command {
        Commands::Status { path, json } => {
            let snapshot = client
                .status(path.as_deref())
                .map_err(|e| match e {
                    ClientError::Unreachable { endpoint } => {
                        anyhow::anyhow!("broker is not running at {endpoint}")
                    }
                    other => anyhow::Error::from(other),
                })?;
            if *json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&snapshot).context("serialize snapshot")?
                );
            } else {
                print_table(&snapshot);
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
