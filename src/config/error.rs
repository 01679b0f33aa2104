//! Errors from loading and checking `mgtd` configuration files.

use std::path::PathBuf;
use thiserror::Error;

/// A configuration file could not be used. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read, or an explicit `--config`
    /// file is missing.
    #[error("Cannot read config file {path}: {source}")]
    Read {
        /// Offending file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for the schema.
    #[error("Cannot parse config file {path}: {source}")]
    Parse {
        /// Offending file.
        path: PathBuf,
        /// TOML error with line and column.
        source: toml::de::Error,
    },

    /// A `[control]` setting is out of range.
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Dotted key, e.g. `control.line_limit`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The `[worker]` section cannot describe a launchable worker.
    #[error("Unusable worker program {path}: {message}")]
    WorkerProgram {
        /// Configured program path; empty when only `args` were given.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },
}
