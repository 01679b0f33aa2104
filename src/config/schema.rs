//! Configuration schema definitions.
//!
//! Scalars are `Option`s so that merging can tell "not set in this file"
//! apart from an explicit value such as `auth_failure_limit = 0`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;
use crate::control::{DEFAULT_LINE_LIMIT, DigestKind};

/// Default consecutive authentication failures before a channel is closed.
pub const DEFAULT_AUTH_FAILURE_LIMIT: u32 = 3;

/// Default initial uplink redial delay in milliseconds.
pub const DEFAULT_UPLINK_BACKOFF_MS: u64 = 1_000;

/// Default maximum uplink redial delay in milliseconds.
pub const DEFAULT_UPLINK_BACKOFF_MAX_MS: u64 = 30_000;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Control channel settings.
    #[serde(default)]
    pub control: ControlConfig,

    /// Worker process settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Parameter overrides, applied before `-p` flags.
    #[serde(default)]
    pub params: BTreeMap<String, ParamSetting>,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars set in `other` win. Parameter maps are merged by key.
    pub fn merge(&mut self, other: Config) {
        self.control.merge(other.control);
        self.worker.merge(other.worker);
        self.params.extend(other.params);
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control.line_limit() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "control.line_limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.control.uplink_backoff_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "control.uplink_backoff_ms".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.control.uplink_backoff_max() < self.control.uplink_backoff() {
            return Err(ConfigError::InvalidValue {
                field: "control.uplink_backoff_max_ms".to_string(),
                message: "must not be below uplink_backoff_ms".to_string(),
            });
        }
        self.worker.validate()
    }
}

impl WorkerConfig {
    /// The program must be absolute; arguments need a program.
    fn validate(&self) -> Result<(), ConfigError> {
        match &self.program {
            Some(program) if !program.is_absolute() => Err(ConfigError::WorkerProgram {
                path: program.clone(),
                message: "must be an absolute path".to_string(),
            }),
            None if !self.args.is_empty() => Err(ConfigError::WorkerProgram {
                path: PathBuf::new(),
                message: "worker.args given without worker.program".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Control channel settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ControlConfig {
    /// Consecutive failed `auth` attempts before the channel is closed.
    /// Zero disables the limit.
    #[serde(default)]
    pub auth_failure_limit: Option<u32>,

    /// Challenge response digest layout.
    #[serde(default)]
    pub digest: Option<DigestKind>,

    /// Maximum request line length in bytes.
    #[serde(default)]
    pub line_limit: Option<usize>,

    /// Initial uplink redial delay in milliseconds.
    #[serde(default)]
    pub uplink_backoff_ms: Option<u64>,

    /// Cap on the uplink redial delay in milliseconds.
    #[serde(default)]
    pub uplink_backoff_max_ms: Option<u64>,
}

impl ControlConfig {
    fn merge(&mut self, other: ControlConfig) {
        if other.auth_failure_limit.is_some() {
            self.auth_failure_limit = other.auth_failure_limit;
        }
        if other.digest.is_some() {
            self.digest = other.digest;
        }
        if other.line_limit.is_some() {
            self.line_limit = other.line_limit;
        }
        if other.uplink_backoff_ms.is_some() {
            self.uplink_backoff_ms = other.uplink_backoff_ms;
        }
        if other.uplink_backoff_max_ms.is_some() {
            self.uplink_backoff_max_ms = other.uplink_backoff_max_ms;
        }
    }

    /// Effective failure limit.
    pub fn auth_failure_limit(&self) -> u32 {
        self.auth_failure_limit.unwrap_or(DEFAULT_AUTH_FAILURE_LIMIT)
    }

    /// Effective digest.
    pub fn digest(&self) -> DigestKind {
        self.digest.unwrap_or_default()
    }

    /// Effective request line limit.
    pub fn line_limit(&self) -> usize {
        self.line_limit.unwrap_or(DEFAULT_LINE_LIMIT)
    }

    /// Effective initial redial delay.
    pub fn uplink_backoff(&self) -> Duration {
        Duration::from_millis(self.uplink_backoff_ms.unwrap_or(DEFAULT_UPLINK_BACKOFF_MS))
    }

    /// Effective redial delay cap.
    pub fn uplink_backoff_max(&self) -> Duration {
        Duration::from_millis(
            self.uplink_backoff_max_ms
                .unwrap_or(DEFAULT_UPLINK_BACKOFF_MAX_MS),
        )
    }
}

/// Worker process settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct WorkerConfig {
    /// Worker executable. Without it, `start` is refused.
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Arguments for the worker executable.
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerConfig {
    fn merge(&mut self, other: WorkerConfig) {
        // Arguments belong to a program, so a new program replaces them.
        if other.program.is_some() {
            self.program = other.program;
            self.args = other.args;
        } else if !other.args.is_empty() {
            self.args = other.args;
        }
    }
}

/// A parameter value as written in TOML: quoted or bare.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ParamSetting {
    /// `name = "64k"`.
    Text(String),
    /// `name = 4`.
    Integer(i64),
    /// `name = 0.5`.
    Float(f64),
    /// `name = true`.
    Bool(bool),
}

impl fmt::Display for ParamSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamSetting::Text(s) => f.write_str(s),
            ParamSetting::Integer(i) => write!(f, "{i}"),
            ParamSetting::Float(x) => write!(f, "{x}"),
            ParamSetting::Bool(b) => f.write_str(if *b { "on" } else { "off" }),
        }
    }
}
