//! Parameter registry error types.

use thiserror::Error;

/// Errors reported by the parameter registry.
///
/// None of these mutate state: a rejected `set` leaves the previous value in
/// place.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    /// No parameter with this name is registered.
    #[error("Unknown parameter \"{0}\"")]
    Unknown(String),

    /// The parameter was made read-only.
    #[error("parameter \"{0}\" is protected")]
    Protected(String),

    /// The value parsed but lies outside the parameter's domain.
    #[error("{name}: value out of range, {message}")]
    OutOfDomain {
        /// Parameter name.
        name: String,
        /// What the domain accepts.
        message: String,
    },

    /// The value could not be parsed at all.
    #[error("{name}: {message}")]
    Syntax {
        /// Parameter name.
        name: String,
        /// Parse failure detail.
        message: String,
    },

    /// A parameter with this name was already registered.
    #[error("parameter \"{0}\" registered twice")]
    Duplicate(String),
}
