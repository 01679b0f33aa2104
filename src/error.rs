//! Startup errors and their process exit codes.

use std::process::ExitCode;

use thiserror::Error;

use crate::config::ConfigError;
use crate::control::ControlError;
use crate::params::ParamError;
use crate::secret::SecretError;

/// Failures that end the process before or while it runs.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Command-line options do not make sense together.
    #[error("{0}")]
    Usage(String),

    /// A configuration file could not be used.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Parameter registration or an initial setting failed.
    #[error("Failed parameter creation: {0}")]
    Param(#[from] ParamError),

    /// The secret could not be read or created.
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// A control endpoint could not be opened.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Anything else that stops startup.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl StartupError {
    /// Exit code reported to the caller.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Param(_) => 2,
            _ => 1,
        }
    }
}

impl From<&StartupError> for ExitCode {
    fn from(e: &StartupError) -> Self {
        ExitCode::from(e.exit_code())
    }
}
