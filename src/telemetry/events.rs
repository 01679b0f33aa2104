//! Audit event types for structured logging.
//!
//! These events go to syslog for audit trails of who controlled the
//! manager and what they changed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::control::ChannelKind;

/// Audit events.
///
/// Each variant is a security- or operations-relevant event. Secrets and
/// challenge responses never appear in an event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// The manager finished startup.
    ManagerStart {
        /// Platform identification string.
        ident: String,
        /// Process id of the manager.
        pid: u32,
        /// Whether control channels require authentication.
        auth: bool,
    },

    /// The manager is exiting.
    ManagerStop {
        /// Why the event loop stopped.
        reason: String,
    },

    /// A session proved knowledge of the secret.
    AuthSuccess {
        /// Session id.
        session: Uuid,
        /// Channel kind.
        channel: ChannelKind,
        /// Remote address.
        peer: String,
    },

    /// A session submitted a wrong response.
    AuthFailure {
        /// Session id.
        session: Uuid,
        /// Channel kind.
        channel: ChannelKind,
        /// Remote address.
        peer: String,
        /// Consecutive failures so far on this session.
        failures: u32,
    },

    /// A control channel closed.
    ChannelClosed {
        /// Session id.
        session: Uuid,
        /// Channel kind.
        channel: ChannelKind,
    },

    /// A parameter was changed through `param.set`.
    ParamChange {
        /// Session that made the change.
        session: Uuid,
        /// Parameter name.
        name: String,
        /// New value as submitted.
        value: String,
    },

    /// The worker process started.
    WorkerStarted {
        /// Worker pid.
        pid: u32,
    },

    /// The worker process exited.
    WorkerExited {
        /// Exit code, if it exited normally.
        code: Option<i32>,
        /// Terminating signal, if killed.
        signal: Option<i32>,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_start_serialization() {
        let event = AuditEvent::ManagerStart {
            ident: "Linux,6.1.0,x86_64".to_string(),
            pid: 12345,
            auth: true,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"manager_start\""));
        assert!(json.contains("\"ident\":\"Linux,6.1.0,x86_64\""));
        assert!(json.contains("\"pid\":12345"));
        assert!(json.contains("\"auth\":true"));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_auth_failure_serialization() {
        let event = AuditEvent::AuthFailure {
            session: Uuid::nil(),
            channel: ChannelKind::Listening,
            peer: "127.0.0.1:40000".to_string(),
            failures: 2,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"auth_failure\""));
        assert!(json.contains("\"channel\":\"listening\""));
        assert!(json.contains("\"peer\":\"127.0.0.1:40000\""));
        assert!(json.contains("\"failures\":2"));
        assert!(json.contains("\"session\":\"00000000-0000-0000-0000-000000000000\""));
    }

    #[test]
    fn test_param_change_serialization() {
        let event = AuditEvent::ParamChange {
            session: Uuid::nil(),
            name: "default_ttl".to_string(),
            value: "60".to_string(),
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"param_change\""));
        assert!(json.contains("\"name\":\"default_ttl\""));
        assert!(json.contains("\"value\":\"60\""));
    }

    #[test]
    fn test_worker_exited_serialization() {
        let event = AuditEvent::WorkerExited {
            code: None,
            signal: Some(15),
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"worker_exited\""));
        assert!(json.contains("\"code\":null"));
        assert!(json.contains("\"signal\":15"));
    }
}
