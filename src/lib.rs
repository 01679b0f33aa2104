//! mgtd: management process for an HTTP cache server
//!
//! The manager owns the runtime parameters, serves administrative command
//! channels and starts and stops the cache worker process.
//!
//! # Architecture
//!
//! - **Params**: Typed parameter registry with domains and read-only flags
//! - **Secret**: Shared secret for challenge-response authentication
//! - **Control**: Command channels over stdin/stdout, TCP listen and TCP uplink,
//!   feeding a single-threaded command dispatcher
//! - **Supervisor**: Worker process lifecycle, driven by the dispatcher
//! - **Symbols**: Address to symbol resolution for diagnostics
//! - **Config**: Hierarchical TOML configuration
//! - **Telemetry**: Structured syslog logging for audit trails

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod manager;
pub mod params;
pub mod pidfile;
pub mod secret;
pub mod supervisor;
pub mod symbols;
pub mod telemetry;
