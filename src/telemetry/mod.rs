//! Telemetry and audit logging for mgtd.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): authentication, parameter changes and
//!   worker lifecycle go to syslog, never to stdout, which may be a control
//!   channel
//! - **Diagnostic logging** (tracing): goes to stderr via `tracing`
//!
//! # Event Format
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"auth_failure","session":"…","channel":"listening","peer":"10.0.0.5:51234","failures":1}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, TimestampedEvent};
pub use syslog::{AuditLogger, DEFAULT_SYSLOG_TAG, init_logger, init_null_logger, try_audit};
