//! Sharded io_uring TCP echo server.

use anyhow::{Context, Result};
use clap::Parser;
use rawring::{EchoServer, ServerConfig};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Echoes every message back on the same connection, one io_uring per shard
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of shards (threads), each with its own ring [default: online CPUs]
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..=64))]
    threads: Option<u16>,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = 7777)]
    port: u16,

    /// Listen backlog
    #[arg(long, default_value_t = 10_000)]
    backlog: i32,

    /// Do not pin shard threads to CPUs
    #[arg(long)]
    no_pin: bool,
}

fn run(args: Args) -> Result<()> {
    let mut builder = ServerConfig::builder()
        .port(args.port)
        .backlog(args.backlog.max(1))
        .pin_threads(!args.no_pin);

    if let Some(threads) = args.threads {
        builder = builder.threads(threads as usize);
    }

    let cfg = builder.try_build().context("invalid configuration")?;
    let server = EchoServer::start(cfg).context("failed to start echo server")?;

    tracing::info!(addr = %server.local_addr(), "ready");

    server.join().context("echo server stopped")
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rawring=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
