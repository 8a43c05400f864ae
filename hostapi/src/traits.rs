//! Host collaborator traits.
//!
//! The sandbox consumes three things from its embedder:
//!
//! - a `SourceResolver` mapping resolved specifiers to module source,
//! - a `PrintSink` that receives guest output when echoing is enabled,
//! - host capabilities, which get a `HostContext` to record output of
//!   their own.

use std::sync::Mutex;

use crate::effects::LogLevel;
use crate::error::HostError;

/// Maps a resolved module specifier to its source bytes.
///
/// Source may be WebAssembly text or binary. Implementations must be
/// deterministic: the same specifier always yields the same source.
pub trait SourceResolver: Send + Sync {
    /// Returns `Ok(None)` when the specifier is unknown.
    fn resolve(&self, specifier: &str) -> Result<Option<Vec<u8>>, HostError>;
}

/// Destination for echoed guest output.
pub trait PrintSink: Send + Sync {
    fn print(&self, text: &str);
}

/// Handle given to capability functions while they run.
pub trait HostContext {
    /// Raw print, recorded as a `Print` effect.
    fn print(&mut self, text: &str);

    /// Console-style log line, recorded as a `Log` effect.
    fn log(&mut self, level: LogLevel, message: &str);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl PrintSink for NullSink {
    fn print(&self, _text: &str) {}
}

/// Writes to standard output.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl PrintSink for StdoutSink {
    fn print(&self, text: &str) {
        println!("{}", text);
    }
}

/// Collects output in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything printed so far.
    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl PrintSink for BufferSink {
    fn print(&self, text: &str) {
        match self.lines.lock() {
            Ok(mut lines) => lines.push(text.to_string()),
            Err(poisoned) => poisoned.into_inner().push(text.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sink_collects_in_order() {
        let sink = BufferSink::new();
        sink.print("one");
        sink.print("two");
        assert_eq!(sink.lines(), vec!["one", "two"]);
    }

    #[test]
    fn test_null_sink_is_silent() {
        NullSink.print("ignored");
    }
}
