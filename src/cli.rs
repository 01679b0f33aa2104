//! Command-line interface definitions for mgtd.
//!
//! Uses clap's derive API for type-safe argument parsing. Cross-option rules
//! that clap cannot express are checked in [`Cli::validate`].

use clap::Parser;
use std::path::PathBuf;

/// Maximum identity length, including room for a terminator on the worker side.
pub const MAX_IDENTITY_LEN: usize = 1024;

/// Management process for an HTTP cache server.
///
/// mgtd owns the runtime parameters, serves the authenticated administrative
/// command channels and starts and stops the cache worker.
#[derive(Parser, Debug, Clone)]
#[command(name = "mgtd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Client listen address for the worker, `address[:port]` (repeatable).
    #[arg(short = 'a', value_name = "ADDRESS")]
    pub listen: Vec<String>,

    /// Backend server, `host[:port]`.
    #[arg(short = 'b', value_name = "BACKEND")]
    pub backend: Option<String>,

    /// Configuration script file for the worker.
    #[arg(short = 'f', value_name = "FILE")]
    pub script: Option<PathBuf>,

    /// Debug mode: serve a control channel on stdin/stdout, stay in the
    /// foreground, stop when stdin closes.
    #[arg(short = 'd')]
    pub debug: bool,

    /// Run in the foreground.
    #[arg(short = 'F')]
    pub foreground: bool,

    /// Identity of this instance.
    #[arg(short = 'i', value_name = "IDENTITY")]
    pub identity: Option<String>,

    /// Shared memory log sizes, `vsl_space[,vsm_space]`.
    #[arg(short = 'l', value_name = "SIZES")]
    pub shm_sizes: Option<String>,

    /// Dial a remote controller at `address:port`.
    #[arg(short = 'M', value_name = "ADDRESS")]
    pub uplink: Option<String>,

    /// Working directory (instance name).
    #[arg(short = 'n', value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Write the process id to this file.
    #[arg(short = 'P', value_name = "FILE")]
    pub pidfile: Option<PathBuf>,

    /// Set a parameter, `name=value` (repeatable).
    #[arg(short = 'p', value_name = "PARAM=VALUE")]
    pub params: Vec<String>,

    /// Make parameters read-only, comma separated (repeatable).
    #[arg(short = 'r', value_name = "PARAMS")]
    pub protect: Vec<String>,

    /// Secret file for control channel authentication. Empty disables
    /// authentication. Default: a generated secret in the working directory.
    #[arg(short = 'S', value_name = "FILE")]
    pub secret: Option<String>,

    /// Listen for control connections on `address:port`. Empty disables.
    #[arg(short = 'T', value_name = "ADDRESS", default_value = "localhost:0")]
    pub control_listen: String,

    /// Default TTL for cached objects, in seconds.
    #[arg(short = 't', value_name = "TTL")]
    pub default_ttl: Option<String>,

    /// Print documentation and exit. `dumpparams` lists all parameters.
    #[arg(short = 'x', value_name = "WHAT", value_parser = ["dumpparams"])]
    pub dump: Option<String>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Check option combinations. Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.debug && self.foreground {
            return Err("Only one of -d or -F can be specified".to_string());
        }
        if self.backend.is_some() && self.script.is_some() {
            return Err("Only one of -b or -f can be specified".to_string());
        }
        if self.control_listen().is_none()
            && !self.debug
            && self.backend.is_none()
            && self.script.is_none()
            && self.uplink().is_none()
        {
            return Err("At least one of -d, -b, -f, -M or -T must be specified".to_string());
        }
        if let Some(id) = &self.identity
            && id.len() + 1 > MAX_IDENTITY_LEN
        {
            return Err("Identity (-i) name too long".to_string());
        }
        if self.listen.is_empty() {
            return Err("Need -a argument(s)".to_string());
        }
        for p in &self.params {
            if Self::parse_param(p).is_none() {
                return Err(format!("Invalid -p argument '{p}', expected name=value"));
            }
        }
        Ok(())
    }

    /// The `-T` address, unless disabled with an empty argument.
    pub fn control_listen(&self) -> Option<&str> {
        Some(self.control_listen.as_str()).filter(|s| !s.is_empty())
    }

    /// The `-M` address, unless empty.
    pub fn uplink(&self) -> Option<&str> {
        self.uplink.as_deref().filter(|s| !s.is_empty())
    }

    /// Split a `-p` argument at the first `=`.
    pub fn parse_param(arg: &str) -> Option<(&str, &str)> {
        let (name, value) = arg.split_once('=')?;
        if name.is_empty() {
            return None;
        }
        Some((name, value))
    }

    /// All `-r` names, flattened.
    pub fn protected_params(&self) -> impl Iterator<Item = &str> {
        self.protect
            .iter()
            .flat_map(|r| r.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// `-l` split into `(vsl_space, vsm_space)`.
    pub fn shm_sizes(&self) -> (Option<&str>, Option<&str>) {
        let Some(arg) = self.shm_sizes.as_deref() else {
            return (None, None);
        };
        let mut parts = arg.split(',').map(str::trim).filter(|s| !s.is_empty());
        (parts.next(), parts.next())
    }
}
