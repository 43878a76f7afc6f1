//! Reads files whole through a kernel-polled io_uring.

use anyhow::{Context, Result};
use clap::Parser;
use rawring::{BulkReader, FileOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Number of trailing bytes printed per file.
const TAIL_LEN: usize = 10;

/// Reads every file with one READV each through an SQPOLL ring
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files to read
    files: Vec<PathBuf>,
}

/// Returns whether every file was read.
fn run(args: Args) -> Result<bool> {
    let reader = BulkReader::kernel_polled().context("failed to set up the ring")?;
    let report = reader.read_all(&args.files)?;

    for file in report.iter() {
        match &file.outcome {
            FileOutcome::Rejected(reason) => {
                eprintln!("File: {}, rejected: {reason:?}", file.path.display());
            }
            FileOutcome::Completed { result, .. } if *result < 0 => {
                let err = std::io::Error::from_raw_os_error(-result);
                eprintln!("File: {}, readv error: {err}", file.path.display());
            }
            FileOutcome::Completed { result, .. } => {
                println!("File: {}, readv res={result}", file.path.display());
                println!("{}", String::from_utf8_lossy(file.tail(TAIL_LEN)));
            }
        }
    }

    Ok(!report.has_rejections())
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
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if args.files.is_empty() {
        eprintln!("No files provided");
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
