//! Host-side error types for the Keel sandbox.
//!
//! `HostError` is what capability functions and source resolvers return.
//! A capability error is surfaced to the guest as an exception; the
//! `Thrown` variant lets a host choose the exact value the guest sees.
//!
//! `ErrorKind` is the shared failure taxonomy used by effect records and
//! by the sandbox's own error type.

use std::fmt;

use serde::Serialize;

use crate::value::Value;

/// Error returned by host capabilities and resolvers.
#[derive(Debug, Clone, PartialEq)]
pub enum HostError {
    /// Throw this value into the guest.
    Thrown(Value),
    /// A host failure with a descriptive message. The guest sees the
    /// message as a string exception.
    Internal(String),
}

impl HostError {
    /// The value the guest observes when this error is thrown at it.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Thrown(value) => value.clone(),
            Self::Internal(msg) => Value::String(msg.clone()),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thrown(value) => write!(f, "host threw: {}", value),
            Self::Internal(msg) => write!(f, "internal host error: {}", msg),
        }
    }
}

impl std::error::Error for HostError {}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Failure taxonomy shared by the effect log and the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ParseError,
    UnresolvedImport,
    CyclicImport,
    UnboundGlobal,
    UnhandledRejection,
    NotReady,
    /// Module failed ABI validation.
    Validation,
    /// A guest exception escaped top-level code or was delivered to a
    /// guest handler.
    Thrown,
    /// An exported async call rejected or never settled.
    Rejected,
    /// Misuse of a value: calling a non-function, writing a frozen
    /// global, bad handles or pointers.
    TypeError,
    /// Fuel, memory, timeout or effect/handle limits.
    ResourceLimit,
    /// Any other engine failure.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "ParseError",
            Self::UnresolvedImport => "UnresolvedImport",
            Self::CyclicImport => "CyclicImport",
            Self::UnboundGlobal => "UnboundGlobal",
            Self::UnhandledRejection => "UnhandledRejection",
            Self::NotReady => "NotReady",
            Self::Validation => "Validation",
            Self::Thrown => "Thrown",
            Self::Rejected => "Rejected",
            Self::TypeError => "TypeError",
            Self::ResourceLimit => "ResourceLimit",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
