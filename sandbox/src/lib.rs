//! `keel-sandbox` — Wasmtime-based execution contract checker for guest
//! script modules.
//!
//! This crate loads a guest module graph, injects the host's capability
//! table, runs top-level code and its asynchronous continuations under a
//! single-threaded cooperative scheduler, and records every observable
//! effect. It enforces:
//!
//! - **Static linkage:** imports resolved and validated before any code runs
//! - **Isolation:** fresh globals, handles and promises for every run
//! - **Ordering:** continuations resume in settlement order, FIFO on ties
//! - **Fuel metering:** instruction-level metering to prevent infinite loops
//! - **Memory and time limits:** bounded linear memory, optional timeout
//! - **Import whitelisting:** `sandbox` intrinsics, `global` capabilities
//!   and guest modules only, no WASI
//!
//! The primary entry point is [`Sandbox::execute`].

pub mod config;
pub mod error;
pub mod exports;
pub mod globals;
pub mod host_impl;
pub mod lifecycle;
pub mod linker;
pub mod loader;
pub mod memory;
pub mod recorder;
pub mod runtime;
pub mod scheduler;
pub mod validation;

pub use config::SandboxConfig;
pub use error::{SandboxError, SourceLocation};
pub use exports::{ExportDecl, ExportKind, ExportSurface};
pub use lifecycle::ExecutionState;
pub use runtime::{Execution, Failure, Program, RunResult, Sandbox, INLINE_SPECIFIER};
pub use scheduler::PromiseState;
