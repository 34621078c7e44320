//! fngated — the fngate daemon.
//!
//! Single binary that assembles the gateway:
//! - HTTP surface (sync + async invocation, system routes, metrics)
//! - Replica sync and active health probes
//! - Connection pool reaper
//! - Broker depth feed into admission
//! - Queue worker pool
//!
//! # Usage
//!
//! ```text
//! fngated serve --config gateway.toml
//! fngated worker --queue reports
//! fngated dead-letters --limit 20
//! ```
//!
//! Configuration comes from defaults, then the optional TOML file, then the
//! environment. Exits 1 when the configuration is invalid or the queue
//! cannot be opened.

mod runtime;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fngate_core::{GatewayConfig, OsEnv};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,fngated=debug,fngate=debug";

#[derive(Parser)]
#[command(name = "fngated", about = "fngate function gateway")]
struct Cli {
    /// TOML file layered between defaults and the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve HTTP and drain the async queue in one process.
    Serve {
        /// Listen port; overrides the configured one.
        #[arg(long)]
        port: Option<u16>,

        /// Accept async invocations without draining them here.
        #[arg(long)]
        no_worker: bool,

        /// Also drain this annotation-selected queue. Repeatable.
        #[arg(long = "queue")]
        queues: Vec<String>,
    },
    /// Drain the async queue without serving HTTP.
    Worker {
        /// Also drain this annotation-selected queue. Repeatable.
        #[arg(long = "queue")]
        queues: Vec<String>,
    },
    /// Print dead-lettered messages as JSON lines.
    DeadLetters {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = GatewayConfig::load(cli.config.as_deref(), &OsEnv)
        .context("loading configuration")?;

    match cli.command {
        Command::Serve {
            port,
            no_worker,
            queues,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            let queues = if no_worker { None } else { Some(queues) };
            runtime::serve(config, queues).await
        }
        Command::Worker { queues } => runtime::work(config, queues).await,
        Command::DeadLetters { limit } => runtime::dead_letters(config, limit).await,
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
