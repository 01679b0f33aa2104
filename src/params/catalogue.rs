//! Built-in parameter set and platform tuning.
//!
//! Only a representative subset of the worker's tunables lives here; the
//! worker reads the rest from its own configuration.

use nix::unistd::{SysconfVar, sysconf};
use tracing::debug;

use super::domain::ParamDomain;
use super::error::ParamError;
use super::registry::{ParamRegistry, ParamSpec};

/// Default worker thread stack size before platform adjustment.
pub const DEFAULT_THREAD_STACK: u64 = 48 * 1024;

/// Used when the platform does not report a minimum thread stack.
const FALLBACK_THREAD_STACK_MIN: u64 = 16 * 1024;

const UNBOUNDED_BYTES: ParamDomain = ParamDomain::Bytes { min: 1024, max: u64::MAX };

fn builtin_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec {
            name: "default_ttl",
            domain: ParamDomain::Seconds { min: 0.0, max: f64::MAX },
            default: "120",
            units: "seconds",
            docs: "The TTL assigned to objects if neither the backend nor the \
                   configuration script assign one.",
        },
        ParamSpec {
            name: "workspace_client",
            domain: ParamDomain::Bytes { min: 9 * 1024, max: u64::MAX },
            default: "64k",
            units: "bytes",
            docs: "Bytes of workspace allocated for client request handling.",
        },
        ParamSpec {
            name: "workspace_backend",
            domain: ParamDomain::Bytes { min: 1024, max: u64::MAX },
            default: "64k",
            units: "bytes",
            docs: "Bytes of workspace allocated for backend request handling.",
        },
        ParamSpec {
            name: "http_req_size",
            domain: ParamDomain::Bytes { min: 256, max: u64::MAX },
            default: "32k",
            units: "bytes",
            docs: "Maximum number of bytes of HTTP client request accepted.",
        },
        ParamSpec {
            name: "http_resp_size",
            domain: ParamDomain::Bytes { min: 256, max: u64::MAX },
            default: "32k",
            units: "bytes",
            docs: "Maximum number of bytes of HTTP backend response accepted.",
        },
        ParamSpec {
            name: "gzip_buffer",
            domain: UNBOUNDED_BYTES,
            default: "32k",
            units: "bytes",
            docs: "Size of malloc buffer used for gzip processing.",
        },
        ParamSpec {
            name: "thread_pool_stack",
            domain: ParamDomain::Bytes { min: 2048, max: u64::MAX },
            default: "48k",
            units: "bytes",
            docs: "Worker thread stack size. The floor is the platform's minimum \
                   thread stack size.",
        },
        ParamSpec {
            name: "thread_pools",
            domain: ParamDomain::Uint { min: 1, max: 64 },
            default: "2",
            units: "pools",
            docs: "Number of worker thread pools.",
        },
        ParamSpec {
            name: "thread_pool_min",
            domain: ParamDomain::Uint { min: 5, max: u64::MAX },
            default: "100",
            units: "threads",
            docs: "The minimum number of worker threads in each pool.",
        },
        ParamSpec {
            name: "thread_pool_max",
            domain: ParamDomain::Uint { min: 10, max: u64::MAX },
            default: "5000",
            units: "threads",
            docs: "The maximum number of worker threads in each pool.",
        },
        ParamSpec {
            name: "vsl_space",
            domain: ParamDomain::Bytes { min: 1024 * 1024, max: 4 << 30 },
            default: "80m",
            units: "bytes",
            docs: "Space reserved for the shared memory log. Takes effect at \
                   worker start.",
        },
        ParamSpec {
            name: "vsm_space",
            domain: ParamDomain::Bytes { min: 1024 * 1024, max: 4 << 30 },
            default: "1m",
            units: "bytes",
            docs: "Space reserved for other shared memory allocations.",
        },
        ParamSpec {
            name: "listen_depth",
            domain: ParamDomain::Uint { min: 0, max: 65535 },
            default: "1024",
            units: "connections",
            docs: "Listen queue depth of the worker's client sockets.",
        },
        ParamSpec {
            name: "cli_limit",
            domain: ParamDomain::Bytes { min: 128, max: 99_999_999 },
            default: "48k",
            units: "bytes",
            docs: "Maximum size of a CLI response. Longer responses are \
                   truncated.",
        },
        ParamSpec {
            name: "http_gzip_support",
            domain: ParamDomain::Bool,
            default: "on",
            units: "bool",
            docs: "Let the worker negotiate gzip with clients and compress \
                   cacheable responses.",
        },
        ParamSpec {
            name: "tcp_keepalive_time",
            domain: ParamDomain::Seconds { min: 1.0, max: 7200.0 },
            default: "600",
            units: "seconds",
            docs: "Idle time before TCP keepalive probes are sent.",
        },
        ParamSpec {
            name: "tcp_keepalive_probes",
            domain: ParamDomain::Uint { min: 1, max: 100 },
            default: "5",
            units: "probes",
            docs: "Unacknowledged keepalive probes before the connection is \
                   dropped.",
        },
        ParamSpec {
            name: "tcp_keepalive_intvl",
            domain: ParamDomain::Seconds { min: 1.0, max: 100.0 },
            default: "5",
            units: "seconds",
            docs: "Seconds between TCP keepalive probes.",
        },
    ]
}

/// Register the built-in parameters and apply platform-specific defaults.
pub fn collect_params() -> Result<ParamRegistry, ParamError> {
    let mut registry = ParamRegistry::new();
    for spec in builtin_params() {
        registry.register(spec)?;
    }

    tcp_defaults(&mut registry);

    if std::mem::size_of::<usize>() < 8 {
        // Conserve address space on narrow-pointer platforms.
        registry.set_default("workspace_client", "24k")?;
        registry.set_default("workspace_backend", "16k")?;
        registry.set_default("http_resp_size", "8k")?;
        registry.set_default("http_req_size", "12k")?;
        registry.set_default("gzip_buffer", "4k")?;
    }

    let low = thread_stack_min();
    registry.set_minimum("thread_pool_stack", &low.to_string())?;
    registry.set_default("thread_pool_stack", &DEFAULT_THREAD_STACK.max(low).to_string())?;

    debug!("Registered {} parameters (stack floor {} bytes)", registry.len(), low);
    Ok(registry)
}

/// The platform's minimum thread stack size in bytes.
pub fn thread_stack_min() -> u64 {
    match sysconf(SysconfVar::PTHREAD_STACK_MIN) {
        Ok(Some(v)) if v > 0 => v as u64,
        _ => FALLBACK_THREAD_STACK_MIN,
    }
}

/// Seed the keepalive defaults from what the kernel hands a fresh socket.
#[cfg(target_os = "linux")]
fn tcp_defaults(registry: &mut ParamRegistry) {
    use nix::sys::socket::{
        AddressFamily, SockFlag, SockType, getsockopt,
        sockopt::{TcpKeepCount, TcpKeepIdle, TcpKeepInterval},
        socket,
    };

    let fd = match socket(AddressFamily::Inet, SockType::Stream, SockFlag::empty(), None) {
        Ok(fd) => fd,
        Err(e) => {
            debug!("Cannot probe TCP keepalive defaults: {}", e);
            return;
        }
    };

    let probes = [
        ("tcp_keepalive_time", getsockopt(&fd, TcpKeepIdle)),
        ("tcp_keepalive_probes", getsockopt(&fd, TcpKeepCount)),
        ("tcp_keepalive_intvl", getsockopt(&fd, TcpKeepInterval)),
    ];
    for (name, value) in probes {
        match value {
            Ok(v) => {
                if let Err(e) = registry.set_default(name, &v.to_string()) {
                    debug!("Kernel default for {} not usable: {}", name, e);
                }
            }
            Err(e) => debug!("getsockopt for {} failed: {}", name, e),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn tcp_defaults(_registry: &mut ParamRegistry) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;

    #[test]
    fn test_collect_params_registers_catalogue() {
        let reg = collect_params().unwrap();
        assert_eq!(reg.len(), builtin_params().len());
        assert!(reg.introspect().iter().all(|p| !p.protected));
    }

    #[test]
    fn test_thread_stack_floor_and_default() {
        let reg = collect_params().unwrap();
        let low = thread_stack_min();
        let info = reg.info("thread_pool_stack").unwrap();

        match reg.get("thread_pool_stack") {
            Some(ParamValue::Bytes(v)) => assert_eq!(*v, DEFAULT_THREAD_STACK.max(low)),
            other => panic!("unexpected value {other:?}"),
        }
        assert!(info.constraints.starts_with(&crate::params::format_bytes(low)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_thread_stack_min_comes_from_sysconf() {
        let reported = sysconf(SysconfVar::PTHREAD_STACK_MIN).unwrap();
        match reported {
            Some(v) if v > 0 => assert_eq!(thread_stack_min(), v as u64),
            _ => assert_eq!(thread_stack_min(), FALLBACK_THREAD_STACK_MIN),
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_wide_pointer_defaults() {
        let reg = collect_params().unwrap();
        assert_eq!(reg.info("workspace_client").unwrap().default, "64k");
        assert_eq!(reg.info("http_req_size").unwrap().default, "32k");
    }
}
