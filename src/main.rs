//! mgtd: management process for an HTTP cache server
//!
//! Entry point. Parses the command line, sets up diagnostic logging and hands
//! over to [`mgtd::manager::run`].
//!
//! # I/O Architecture
//!
//! - **Audit logging**: Goes to syslog, never to stdout
//! - **Debug logging**: Goes to stderr. In debug mode (`-d`) stdout carries
//!   the local control channel, so nothing else may write there

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use mgtd::cli::Cli;
use tracing::{debug, error};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    debug!("Parsed CLI arguments: {:?}", cli);

    match mgtd::manager::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {e}");
            ExitCode::from(&e)
        }
    }
}

/// Initialize the tracing subscriber for diagnostic logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
