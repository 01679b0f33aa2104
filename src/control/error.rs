//! Control channel error types.

use std::io;
use thiserror::Error;

/// Errors that end a single channel, or prevent one from opening.
///
/// None of these are fatal to the process once startup has completed.
#[derive(Debug, Error)]
pub enum ControlError {
    /// I/O failure on the channel.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The peer broke the framing rules.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The dispatcher has stopped; the process is shutting down.
    #[error("Command dispatcher is gone")]
    DispatcherGone,

    /// A listen address could not be resolved or bound.
    #[error("Could not open listen address {addr}: {message}")]
    Bind {
        /// Address as given on the command line.
        addr: String,
        /// What went wrong.
        message: String,
    },
}

/// Result type for control channel operations.
pub type ControlResult<T> = Result<T, ControlError>;
