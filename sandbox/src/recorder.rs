//! Effect recorder — the append-only sink for a run's observable effects.
//!
//! Every print, log line, tracked global write and error passes through
//! here. When echoing is enabled, text is also forwarded to the host's
//! `PrintSink`. Once the log reaches `max_effects` entries, further
//! appends fail with `ResourceLimit`; the log itself is never truncated.

use std::sync::Arc;

use keel_hostapi::{
    EffectKind, EffectLog, ErrorKind, HostContext, LogLevel, PrintSink, Value,
};

use crate::error::SandboxError;

pub struct EffectRecorder {
    log: EffectLog,
    sink: Arc<dyn PrintSink>,
    echo: bool,
    max_effects: usize,
    /// Set when an append was refused; surfaced by the runtime after the
    /// current host call returns.
    overflowed: bool,
}

impl EffectRecorder {
    pub fn new(sink: Arc<dyn PrintSink>, echo: bool, max_effects: usize) -> Self {
        Self {
            log: EffectLog::new(),
            sink,
            echo,
            max_effects,
            overflowed: false,
        }
    }

    pub fn effects(&self) -> &EffectLog {
        &self.log
    }

    pub fn into_log(self) -> EffectLog {
        self.log
    }

    /// Take the overflow flag, clearing it.
    pub fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    fn append(&mut self, kind: EffectKind) -> Result<u64, SandboxError> {
        if self.log.len() >= self.max_effects {
            self.overflowed = true;
            return Err(SandboxError::ResourceLimit(format!(
                "effect log limit of {} entries reached",
                self.max_effects
            )));
        }
        Ok(self.log.append(kind))
    }

    pub fn record_print(&mut self, text: &str) -> Result<(), SandboxError> {
        self.append(EffectKind::Print {
            text: text.to_string(),
        })?;
        if self.echo {
            self.sink.print(text);
        }
        Ok(())
    }

    pub fn record_log(&mut self, level: LogLevel, message: &str) -> Result<(), SandboxError> {
        self.append(EffectKind::Log {
            level,
            message: message.to_string(),
        })?;
        if self.echo {
            self.sink.print(message);
        }
        Ok(())
    }

    pub fn record_global_set(&mut self, name: &str, value: &Value) -> Result<(), SandboxError> {
        self.append(EffectKind::GlobalSet {
            name: name.to_string(),
            value: value.clone(),
        })?;
        Ok(())
    }

    /// Record an error. Error records bypass the effect limit so a run's
    /// failure is always visible in its log.
    pub fn record_error(&mut self, kind: ErrorKind, message: &str, caught: bool) {
        self.log.append(EffectKind::Error {
            kind,
            message: message.to_string(),
            caught,
        });
    }
}

impl HostContext for EffectRecorder {
    fn print(&mut self, text: &str) {
        // Overflow is reported through `take_overflow`.
        let _ = self.record_print(text);
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        let _ = self.record_log(level, message);
    }
}
