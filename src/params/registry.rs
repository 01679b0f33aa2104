//! The parameter registry.
//!
//! All registration and default computation happens during startup. After
//! that the registry is moved into the command dispatcher: the key set is
//! fixed and only values change, always from the dispatcher task, so no
//! locking is involved.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use tracing::debug;

use super::domain::{ParamDomain, ParamValue};
use super::error::ParamError;

/// Static description of one parameter, handed to [`ParamRegistry::register`].
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Unique name.
    pub name: &'static str,
    /// Accepted values.
    pub domain: ParamDomain,
    /// Default value, in operator syntax.
    pub default: &'static str,
    /// Units shown next to the value (`bytes`, `seconds`, ...).
    pub units: &'static str,
    /// One-paragraph documentation.
    pub docs: &'static str,
}

#[derive(Debug, Clone)]
struct Param {
    domain: ParamDomain,
    default: ParamValue,
    value: ParamValue,
    units: &'static str,
    docs: &'static str,
    protected: bool,
}

/// Introspection record for one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    /// Parameter name.
    pub name: String,
    /// Current value, rendered.
    pub value: String,
    /// Default value, rendered.
    pub default: String,
    /// Accepted values, rendered.
    pub constraints: String,
    /// Units.
    pub units: &'static str,
    /// Documentation text.
    pub docs: &'static str,
    /// Whether the parameter is read-only.
    pub protected: bool,
}

impl ParamInfo {
    /// True when the current value differs from the default.
    pub fn is_modified(&self) -> bool {
        self.value != self.default
    }
}

/// Named, typed, bounded runtime parameters.
#[derive(Debug, Default)]
pub struct ParamRegistry {
    params: BTreeMap<&'static str, Param>,
}

impl ParamRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter with its default value.
    pub fn register(&mut self, spec: ParamSpec) -> Result<(), ParamError> {
        if self.params.contains_key(spec.name) {
            return Err(ParamError::Duplicate(spec.name.to_string()));
        }
        let default = spec.domain.parse(spec.name, spec.default)?;
        self.params.insert(
            spec.name,
            Param {
                domain: spec.domain,
                value: default.clone(),
                default,
                units: spec.units,
                docs: spec.docs,
                protected: false,
            },
        );
        Ok(())
    }

    /// Set a parameter from operator input.
    ///
    /// Protected parameters and out-of-domain values are rejected without
    /// touching the stored value.
    pub fn set(&mut self, name: &str, raw: &str) -> Result<(), ParamError> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| ParamError::Unknown(name.to_string()))?;
        if param.protected {
            return Err(ParamError::Protected(name.to_string()));
        }
        let value = param.domain.parse(name, raw)?;
        debug!("param {} = {}", name, value);
        param.value = value;
        Ok(())
    }

    /// Replace the default value. A parameter still at its old default follows
    /// the new one.
    pub fn set_default(&mut self, name: &str, raw: &str) -> Result<(), ParamError> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| ParamError::Unknown(name.to_string()))?;
        let default = param.domain.parse(name, raw)?;
        if param.value == param.default {
            param.value = default.clone();
        }
        param.default = default;
        Ok(())
    }

    /// Raise the floor of a numeric parameter.
    ///
    /// If the current value falls below the new floor it is lifted to it.
    pub fn set_minimum(&mut self, name: &str, raw: &str) -> Result<(), ParamError> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| ParamError::Unknown(name.to_string()))?;
        let domain = param.domain.with_minimum(name, raw)?;
        let floor = domain.parse(name, raw)?;
        if domain.parse(name, &param.value.to_string()).is_err() {
            param.value = floor.clone();
        }
        if domain.parse(name, &param.default.to_string()).is_err() {
            param.default = floor;
        }
        param.domain = domain;
        Ok(())
    }

    /// Make a parameter read-only until restart.
    pub fn protect(&mut self, name: &str) -> Result<(), ParamError> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| ParamError::Unknown(name.to_string()))?;
        param.protected = true;
        Ok(())
    }

    /// Current value of a parameter.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name).map(|p| &p.value)
    }

    /// Introspection record for a single parameter.
    pub fn info(&self, name: &str) -> Option<ParamInfo> {
        self.params.get_key_value(name).map(|(k, p)| info(k, p))
    }

    /// All parameters, sorted by name.
    pub fn introspect(&self) -> Vec<ParamInfo> {
        self.params.iter().map(|(k, p)| info(k, p)).collect()
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// reStructuredText reference of every parameter, for documentation builds.
    pub fn dump_rst(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, ".. The following is autogenerated output from mgtd -x dumpparams\n");
        for p in self.introspect() {
            let _ = writeln!(out, ".. _ref_param_{}:\n", p.name);
            let _ = writeln!(out, "{}", p.name);
            let _ = writeln!(out, "{}", "~".repeat(p.name.len()));
            if !p.units.is_empty() {
                let _ = writeln!(out, "\t* Units: {}", p.units);
            }
            let _ = writeln!(out, "\t* Default: {}", p.default);
            let _ = writeln!(out, "\t* Domain: {}\n", p.constraints);
            let _ = writeln!(out, "{}\n", p.docs);
        }
        out
    }
}

fn info(name: &str, p: &Param) -> ParamInfo {
    ParamInfo {
        name: name.to_string(),
        value: p.value.to_string(),
        default: p.default.to_string(),
        constraints: p.domain.describe(),
        units: p.units,
        docs: p.docs,
        protected: p.protected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ParamRegistry {
        let mut reg = ParamRegistry::new();
        reg.register(ParamSpec {
            name: "listen_depth",
            domain: ParamDomain::Uint { min: 0, max: 65535 },
            default: "1024",
            units: "connections",
            docs: "Listen queue depth.",
        })
        .unwrap();
        reg.register(ParamSpec {
            name: "thread_pool_stack",
            domain: ParamDomain::Bytes { min: 2048, max: u64::MAX },
            default: "48k",
            units: "bytes",
            docs: "Worker thread stack size.",
        })
        .unwrap();
        reg
    }

    #[test]
    fn test_set_and_get() {
        let mut reg = registry();
        reg.set("listen_depth", "10").unwrap();
        assert_eq!(reg.get("listen_depth"), Some(&ParamValue::Uint(10)));
        assert!(reg.info("listen_depth").unwrap().is_modified());
    }

    #[test]
    fn test_set_unknown() {
        let mut reg = registry();
        assert_eq!(
            reg.set("no_such_param", "1"),
            Err(ParamError::Unknown("no_such_param".to_string()))
        );
    }

    #[test]
    fn test_protected_rejects_every_write() {
        let mut reg = registry();
        reg.set("listen_depth", "7").unwrap();
        reg.protect("listen_depth").unwrap();

        for _ in 0..2 {
            assert_eq!(
                reg.set("listen_depth", "9"),
                Err(ParamError::Protected("listen_depth".to_string()))
            );
            assert_eq!(reg.get("listen_depth"), Some(&ParamValue::Uint(7)));
        }
        assert!(reg.info("listen_depth").unwrap().protected);
    }

    #[test]
    fn test_out_of_domain_does_not_mutate() {
        let mut reg = registry();
        reg.set("listen_depth", "100").unwrap();
        let err = reg.set("listen_depth", "70000").unwrap_err();
        assert!(matches!(err, ParamError::OutOfDomain { .. }));
        assert_eq!(reg.get("listen_depth"), Some(&ParamValue::Uint(100)));

        let err = reg.set("listen_depth", "lots").unwrap_err();
        assert!(matches!(err, ParamError::Syntax { .. }));
        assert_eq!(reg.get("listen_depth"), Some(&ParamValue::Uint(100)));
    }

    #[test]
    fn test_set_default_follows_untouched_value() {
        let mut reg = registry();
        reg.set_default("thread_pool_stack", "64k").unwrap();
        assert_eq!(reg.get("thread_pool_stack"), Some(&ParamValue::Bytes(64 * 1024)));

        reg.set("thread_pool_stack", "128k").unwrap();
        reg.set_default("thread_pool_stack", "32k").unwrap();
        assert_eq!(reg.get("thread_pool_stack"), Some(&ParamValue::Bytes(128 * 1024)));
        assert_eq!(reg.info("thread_pool_stack").unwrap().default, "32k");
    }

    #[test]
    fn test_set_minimum_lifts_value() {
        let mut reg = registry();
        reg.set("thread_pool_stack", "4k").unwrap();
        reg.set_minimum("thread_pool_stack", "16k").unwrap();
        assert_eq!(reg.get("thread_pool_stack"), Some(&ParamValue::Bytes(16 * 1024)));
        assert!(matches!(
            reg.set("thread_pool_stack", "8k"),
            Err(ParamError::OutOfDomain { .. })
        ));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut reg = registry();
        let err = reg
            .register(ParamSpec {
                name: "listen_depth",
                domain: ParamDomain::Bool,
                default: "on",
                units: "",
                docs: "",
            })
            .unwrap_err();
        assert_eq!(err, ParamError::Duplicate("listen_depth".to_string()));
    }

    #[test]
    fn test_introspect_sorted_and_dump() {
        let reg = registry();
        let names: Vec<_> = reg.introspect().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["listen_depth", "thread_pool_stack"]);

        let rst = reg.dump_rst();
        assert!(rst.contains("thread_pool_stack\n~~~~~~~~~~~~~~~~~"));
        assert!(rst.contains("\t* Default: 48k"));
    }
}
