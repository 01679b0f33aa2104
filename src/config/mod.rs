//! Configuration system for mgtd.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/mgtd/config.toml`
//! 2. User config: `~/.config/mgtd/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority, applied by the manager)
//!
//! No config file is required; every setting has a built-in default.
//!
//! # Merge Behavior
//!
//! - **Scalars** (limits, digest, worker program) are **overridden** when set
//! - **Maps** (`[params]`) are **merged** (later values override)
//!
//! # Example
//!
//! ```toml
//! [control]
//! auth_failure_limit = 5
//! digest = "newline-framed"
//!
//! [worker]
//! program = "/usr/sbin/cached"
//! args = ["--foreground"]
//!
//! [params]
//! default_ttl = 300
//! thread_pools = 4
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{Config, ControlConfig, ParamSetting, WorkerConfig};
