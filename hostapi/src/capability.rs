//! Host capability table.
//!
//! The host publishes its whole capability surface as one table before a
//! run starts. Each run receives a fresh copy, so guest writes never leak
//! between runs. Names marked frozen cannot be overwritten by guests.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::HostError;
use crate::traits::HostContext;
use crate::value::Value;

/// A host-implemented function callable from guest code.
pub type HostFn =
    Arc<dyn Fn(&mut dyn HostContext, &[Value]) -> Result<Value, HostError> + Send + Sync>;

/// One entry of the capability table.
#[derive(Clone)]
pub enum Capability {
    Function(HostFn),
    Value(Value),
}

impl Capability {
    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Function(_) => None,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// Ordered mapping from capability name to implementation.
///
/// `BTreeMap` keeps enumeration order stable across runs.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: BTreeMap<String, Capability>,
    frozen: BTreeSet<String>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert_function`](Self::insert_function).
    pub fn with_function<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut dyn HostContext, &[Value]) -> Result<Value, HostError> + Send + Sync + 'static,
    {
        self.insert_function(name, f);
        self
    }

    /// Builder form of [`insert_value`](Self::insert_value).
    pub fn with_value(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert_value(name, value);
        self
    }

    /// Mark a name read-only for guests.
    pub fn frozen(mut self, name: &str) -> Self {
        self.frozen.insert(name.to_string());
        self
    }

    pub fn insert_function<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut dyn HostContext, &[Value]) -> Result<Value, HostError> + Send + Sync + 'static,
    {
        self.entries
            .insert(name.to_string(), Capability::Function(Arc::new(f)));
    }

    pub fn insert_value(&mut self, name: &str, value: impl Into<Value>) {
        self.entries
            .insert(name.to_string(), Capability::Value(value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_frozen(&self, name: &str) -> bool {
        self.frozen.contains(name)
    }

    /// Capability names in enumeration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Capability)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
