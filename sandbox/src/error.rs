//! Sandbox error types.

use std::fmt;

use keel_hostapi::{ErrorKind, HostError};

use crate::lifecycle::ExecutionState;

/// Where in a guest module's source a parse error was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLocation {
    /// 1-based line and column in WebAssembly text.
    LineCol { line: usize, column: usize },
    /// Byte offset in a WebAssembly binary.
    Offset(usize),
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LineCol { line, column } => write!(f, "{}:{}", line, column),
            Self::Offset(offset) => write!(f, "offset 0x{:x}", offset),
        }
    }
}

/// Top-level error type for the sandbox crate.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Guest source is not a valid module.
    #[error("parse error in '{specifier}': {message}")]
    Parse {
        specifier: String,
        message: String,
        location: Option<SourceLocation>,
    },

    /// A specifier could not be mapped to source.
    #[error("unresolved import '{specifier}'{}", importer.as_ref().map(|i| format!(" (imported from '{}')", i)).unwrap_or_default())]
    UnresolvedImport {
        importer: Option<String>,
        specifier: String,
    },

    /// The import graph contains a cycle. The first member is repeated at
    /// the end.
    #[error("cyclic import: {}", cycle.join(" -> "))]
    CyclicImport { cycle: Vec<String> },

    /// Guest referenced a global missing from the capability set.
    #[error("unbound global '{name}'")]
    UnboundGlobal { name: String },

    /// A promise rejected with no guest handler by settlement.
    #[error("unhandled rejection: {reason}")]
    UnhandledRejection { reason: String },

    /// The execution has not settled yet.
    #[error("execution not ready (state: {state})")]
    NotReady { state: ExecutionState },

    /// Module validation failed (bad imports, missing memory, etc.).
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Guest exception escaped top-level code.
    #[error("uncaught exception: {value}")]
    Uncaught { value: String },

    /// An exported async call rejected.
    #[error("call rejected: {reason}")]
    Rejected { reason: String },

    /// An exported async call left its promise pending with no work left.
    #[error("call to '{name}' never settled")]
    Unsettled { name: String },

    /// Guest called a global, or the host called an export, that is not
    /// a callable function.
    #[error("'{name}' is not callable")]
    NotCallable { name: String },

    /// The host named an export the entry module does not declare.
    #[error("no export named '{name}'")]
    UnknownExport { name: String },

    /// Guest wrote to a frozen global.
    #[error("global '{name}' is frozen")]
    FrozenGlobal { name: String },

    /// Guest passed a handle that does not exist.
    #[error("invalid value handle {0}")]
    BadHandle(i32),

    /// Guest passed an out-of-bounds pointer or invalid UTF-8.
    #[error("bad pointer: {0}")]
    BadPointer(String),

    /// Effect, handle or memory limit reached.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Fuel exhausted during execution.
    #[error("fuel exhausted (instruction limit)")]
    FuelExhausted,

    /// Wall-clock timeout reached.
    #[error("execution timed out")]
    Timeout,

    /// WASM guest trapped.
    #[error("guest trapped: {0}")]
    GuestTrapped(String),

    /// A lifecycle transition out of a terminal state, or out of order.
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: ExecutionState,
        to: ExecutionState,
    },

    /// Host resolver failure.
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// Wasmtime engine, compilation, or instantiation error.
    #[error("wasmtime error: {0}")]
    Wasmtime(#[from] anyhow::Error),
}

impl SandboxError {
    /// Map onto the shared failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } => ErrorKind::ParseError,
            Self::UnresolvedImport { .. } => ErrorKind::UnresolvedImport,
            Self::CyclicImport { .. } => ErrorKind::CyclicImport,
            Self::UnboundGlobal { .. } => ErrorKind::UnboundGlobal,
            Self::UnhandledRejection { .. } => ErrorKind::UnhandledRejection,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::ValidationError(_) => ErrorKind::Validation,
            Self::Uncaught { .. } => ErrorKind::Thrown,
            Self::Rejected { .. } | Self::Unsettled { .. } => ErrorKind::Rejected,
            Self::NotCallable { .. }
            | Self::UnknownExport { .. }
            | Self::FrozenGlobal { .. }
            | Self::BadHandle(_)
            | Self::BadPointer(_) => ErrorKind::TypeError,
            Self::ResourceLimit(_) | Self::FuelExhausted | Self::Timeout => {
                ErrorKind::ResourceLimit
            }
            Self::GuestTrapped(_)
            | Self::InvalidTransition { .. }
            | Self::Host(_)
            | Self::Wasmtime(_) => ErrorKind::Internal,
        }
    }

    /// Source location, for parse errors that carry one.
    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            Self::Parse { location, .. } => *location,
            _ => None,
        }
    }
}
