//! Per-run globals — the injected capability set.
//!
//! `Globals::inject` copies the host's `CapabilityTable` in one step
//! before any guest code runs, so guests never observe a partially
//! populated set. Guest writes land in this copy only; the next run
//! injects the untouched baseline again.

use keel_hostapi::{Capability, CapabilityTable, HostFn, Value};

use crate::error::SandboxError;

/// What a guest read of a global produced.
#[derive(Debug, Clone)]
pub enum Lookup {
    Value(Value),
    Function,
}

pub struct Globals {
    table: CapabilityTable,
}

impl Globals {
    /// Install the baseline for one run.
    pub fn inject(baseline: &CapabilityTable) -> Self {
        Self {
            table: baseline.clone(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains(name)
    }

    /// Read a global. Functions are reported as such; guests call them
    /// through their `global` imports instead.
    pub fn get(&self, name: &str) -> Result<Lookup, SandboxError> {
        match self.table.get(name) {
            Some(Capability::Value(value)) => Ok(Lookup::Value(value.clone())),
            Some(Capability::Function(_)) => Ok(Lookup::Function),
            None => Err(SandboxError::UnboundGlobal {
                name: name.to_string(),
            }),
        }
    }

    /// Write a global. Creates the name if missing; frozen names refuse.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), SandboxError> {
        if self.table.is_frozen(name) {
            return Err(SandboxError::FrozenGlobal {
                name: name.to_string(),
            });
        }
        self.table.insert_value(name, value);
        Ok(())
    }

    /// Resolve a callable global at call time.
    pub fn function(&self, name: &str) -> Result<HostFn, SandboxError> {
        match self.table.get(name) {
            Some(Capability::Function(f)) => Ok(f.clone()),
            Some(Capability::Value(_)) => Err(SandboxError::NotCallable {
                name: name.to_string(),
            }),
            None => Err(SandboxError::UnboundGlobal {
                name: name.to_string(),
            }),
        }
    }

    /// Current capability view.
    pub fn table(&self) -> &CapabilityTable {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> CapabilityTable {
        CapabilityTable::new()
            .with_value("input", 42)
            .with_value("locked", "fixed")
            .frozen("locked")
            .with_function("default_func", |_, _| Ok(Value::Undefined))
    }

    #[test]
    fn test_inject_exposes_whole_baseline() {
        let globals = Globals::inject(&baseline());
        assert!(globals.contains("input"));
        assert!(globals.contains("locked"));
        assert!(globals.contains("default_func"));
        assert_eq!(globals.table().len(), 3);
    }

    #[test]
    fn test_missing_global_is_unbound() {
        let globals = Globals::inject(&baseline());
        let err = globals.get("nope").unwrap_err();
        assert!(matches!(err, SandboxError::UnboundGlobal { ref name } if name == "nope"));
        let err = globals.function("nope").err().unwrap();
        assert!(matches!(err, SandboxError::UnboundGlobal { .. }));
    }

    #[test]
    fn test_writes_do_not_touch_baseline() {
        let base = baseline();
        let mut first = Globals::inject(&base);
        first.set("input", Value::from("changed")).unwrap();
        first.set("stmt", Value::from("new")).unwrap();

        let second = Globals::inject(&base);
        assert!(matches!(second.get("input").unwrap(), Lookup::Value(Value::Number(n)) if n == 42.0));
        assert!(!second.contains("stmt"));
    }

    #[test]
    fn test_frozen_global_refuses_write() {
        let mut globals = Globals::inject(&baseline());
        let err = globals.set("locked", Value::Null).unwrap_err();
        assert!(matches!(err, SandboxError::FrozenGlobal { .. }));
    }

    #[test]
    fn test_overwritten_function_is_not_callable() {
        let mut globals = Globals::inject(&baseline());
        assert!(globals.function("default_func").is_ok());
        assert!(matches!(globals.get("default_func").unwrap(), Lookup::Function));

        globals.set("default_func", Value::from(1)).unwrap();
        let err = globals.function("default_func").err().unwrap();
        assert!(matches!(err, SandboxError::NotCallable { .. }));
    }
}
