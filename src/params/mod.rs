//! Runtime parameter registry.
//!
//! Parameters are registered once at startup with a domain and a default,
//! may be overridden from the command line (`-p name=value`), the config file
//! or a `param.set` command, and can be made read-only (`-r name`).
//!
//! ```
//! use mgtd::params::{ParamDomain, ParamError, ParamRegistry, ParamSpec};
//!
//! let mut reg = ParamRegistry::new();
//! reg.register(ParamSpec {
//!     name: "thread_pools",
//!     domain: ParamDomain::Uint { min: 1, max: 64 },
//!     default: "2",
//!     units: "pools",
//!     docs: "Number of worker thread pools.",
//! })?;
//! reg.protect("thread_pools")?;
//! assert!(matches!(reg.set("thread_pools", "4"), Err(ParamError::Protected(_))));
//! # Ok::<(), ParamError>(())
//! ```

mod catalogue;
mod domain;
mod error;
mod registry;

pub use catalogue::{DEFAULT_THREAD_STACK, collect_params, thread_stack_min};
pub use domain::{ParamDomain, ParamValue, format_bytes, parse_bytes};
pub use error::ParamError;
pub use registry::{ParamInfo, ParamRegistry, ParamSpec};
