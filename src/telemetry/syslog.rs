//! Syslog integration for audit logging.

use std::sync::{Mutex, OnceLock};

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag used when no instance name is given.
pub const DEFAULT_SYSLOG_TAG: &str = "mgtd";

/// Global audit logger instance.
static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Audit logger that writes structured JSON events to syslog.
///
/// Uses a Mutex so events can be logged through the shared global reference.
pub struct AuditLogger {
    /// None indicates a null logger.
    writer: Option<Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>>,
}

impl AuditLogger {
    /// Connect to the local syslog daemon with the given tag.
    pub fn new(tag: &str) -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: tag.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter)
            .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Connected to syslog with tag '{}'", tag);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Create a null audit logger that discards all events.
    pub fn new_null() -> Self {
        Self { writer: None }
    }

    /// Log an audit event to syslog.
    ///
    /// Null loggers drop the event after tracing it at debug level.
    pub fn log(&self, event: AuditEvent) {
        let json = match serde_json::to_string(&event.with_timestamp()) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let Some(ref writer) = self.writer else {
            debug!("Audit event (not sent): {}", json);
            return;
        };

        match writer.lock() {
            Ok(mut writer) => {
                if let Err(e) = writer.info(&json) {
                    error!("Failed to write to syslog: {}", e);
                }
            }
            Err(e) => error!("Failed to acquire syslog writer lock: {}", e),
        }
        debug!("Logged audit event: {}", json);
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        self.writer.is_none()
    }
}

/// Initialize the global audit logger with a syslog connection.
pub fn init_logger(tag: &str) -> Result<(), TelemetryError> {
    let logger = AuditLogger::new(tag)?;
    AUDIT_LOGGER
        .set(logger)
        .map_err(|_| TelemetryError::AlreadyInitialized)
}

/// Install a null logger, for hosts without a syslog daemon.
pub fn init_null_logger() -> Result<(), TelemetryError> {
    AUDIT_LOGGER
        .set(AuditLogger::new_null())
        .map_err(|_| TelemetryError::AlreadyInitialized)
}

/// The global audit logger, if one was installed.
pub fn try_audit() -> Option<&'static AuditLogger> {
    AUDIT_LOGGER.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_logger_discards() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());
        logger.log(AuditEvent::WorkerStarted { pid: 1 });
    }

    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_logger_creation() {
        let logger = AuditLogger::new(DEFAULT_SYSLOG_TAG).unwrap();
        assert!(!logger.is_null());
        logger.log(AuditEvent::ManagerStop {
            reason: "test".to_string(),
        });
    }
}
