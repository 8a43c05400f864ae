//! `keel-hostapi` — host-facing types for the Keel guest script sandbox.
//!
//! This crate defines what an embedder hands to the sandbox and what it
//! gets back. It provides:
//!
//! - `Value` — guest-visible values
//! - `CapabilityTable` — the host capability surface injected into runs
//! - `EffectLog` — the ordered record of a run's observable effects
//! - `SourceResolver`, `PrintSink`, `HostContext` — collaborator traits
//! - `MemResolver`, `FsResolver` — resolver implementations
//! - `HostError`, `ErrorKind` — host errors and the shared failure taxonomy
//! - `abi` — guest import namespaces and intrinsic names

pub mod abi;
pub mod capability;
pub mod effects;
pub mod error;
pub mod resolver;
pub mod traits;
pub mod value;

// Re-export commonly used types at the crate root.
pub use capability::{Capability, CapabilityTable, HostFn};
pub use effects::{Effect, EffectKind, EffectLog, LogLevel};
pub use error::{ErrorKind, HostError};
pub use resolver::{FsResolver, MemResolver};
pub use traits::{BufferSink, HostContext, NullSink, PrintSink, SourceResolver, StdoutSink};
pub use value::{PromiseId, Value};
