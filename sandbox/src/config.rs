//! Sandbox configuration.

use std::time::Duration;

/// Configuration for the guest sandbox.
///
/// Controls memory limits, instruction fuel, and per-run bookkeeping limits.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum linear memory pages per guest memory (1 page = 64 KiB).
    /// Default: 256 pages = 16 MiB.
    pub max_memory_pages: u32,

    /// Wasmtime fuel for the run's top-level code and its continuations.
    /// Every exported call afterwards gets a fresh allowance of the same size.
    pub fuel_limit: u64,

    /// Maximum number of effect log entries per run.
    pub max_effects: usize,

    /// Maximum number of live value handles per run.
    pub max_handles: usize,

    /// Forward guest print/log output to the sandbox's `PrintSink`.
    pub echo_guest_output: bool,

    /// Wall-clock limit for a run. Enables epoch interruption.
    pub timeout: Option<Duration>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_pages: 256, // 16 MiB
            fuel_limit: 100_000_000,
            max_effects: 10_000,
            max_handles: 65_536,
            echo_guest_output: false,
            timeout: None,
        }
    }
}

impl SandboxConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Maximum guest memory in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_pages as usize) * 65536
    }
}
