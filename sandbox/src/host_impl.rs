//! Per-run mutable state held in the Wasmtime Store.
//!
//! `RunState` combines the effect recorder, the injected globals, the value
//! handle table and the promise scheduler into a single struct that lives
//! inside `Store<RunState>` for the duration of one run.

use std::sync::Arc;
use std::time::Instant;

use wasmtime::{StoreLimits, StoreLimitsBuilder, Trap, TypedFunc};

use keel_hostapi::{abi, CapabilityTable, PrintSink, PromiseId, Value};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::globals::Globals;
use crate::recorder::EffectRecorder;
use crate::scheduler::Scheduler;

/// A guest export registered with `then`/`catch`, plus the environment
/// value handed back to it on every call.
#[derive(Clone)]
pub struct Continuation {
    pub func: TypedFunc<(i32, i32), i32>,
    pub env: Value,
}

/// Error raised from host functions to unwind guest code.
///
/// Travels through Wasmtime as the trap payload and is recovered by
/// downcasting in [`classify`].
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// Guest-level exception; catchable by promise handlers.
    #[error("uncaught exception: {0}")]
    Thrown(Value),

    /// Sandbox fault; always ends the run.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Value handle table. Handle 0 is permanently `undefined`.
pub struct HandleTable {
    values: Vec<Value>,
    max_handles: usize,
}

impl HandleTable {
    pub fn new(max_handles: usize) -> Self {
        Self {
            values: vec![Value::Undefined],
            max_handles,
        }
    }

    pub fn alloc(&mut self, value: Value) -> Result<i32, SandboxError> {
        if value.is_undefined() {
            return Ok(abi::UNDEFINED_HANDLE);
        }
        if self.values.len() >= self.max_handles {
            return Err(SandboxError::ResourceLimit(format!(
                "value handle limit of {} reached",
                self.max_handles
            )));
        }
        self.values.push(value);
        Ok((self.values.len() - 1) as i32)
    }

    pub fn get(&self, handle: i32) -> Result<&Value, SandboxError> {
        usize::try_from(handle)
            .ok()
            .and_then(|i| self.values.get(i))
            .ok_or(SandboxError::BadHandle(handle))
    }

    pub fn get_mut(&mut self, handle: i32) -> Result<&mut Value, SandboxError> {
        if handle == abi::UNDEFINED_HANDLE {
            return Err(SandboxError::BadHandle(handle));
        }
        usize::try_from(handle)
            .ok()
            .and_then(|i| self.values.get_mut(i))
            .ok_or(SandboxError::BadHandle(handle))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        // Handle 0 is always present.
        false
    }
}

/// Per-run mutable state held in the Wasmtime `Store`.
///
/// Created fresh for every run from the host's capability baseline, so
/// nothing a guest does survives into the next run.
pub struct RunState {
    pub recorder: EffectRecorder,
    pub globals: Globals,
    pub handles: HandleTable,
    pub scheduler: Scheduler<Continuation>,
    pub limits: StoreLimits,
    /// Wall-clock deadline of the guest code currently running.
    pub deadline: Option<Instant>,
}

impl RunState {
    pub fn new(
        config: &SandboxConfig,
        sink: Arc<dyn PrintSink>,
        capabilities: &CapabilityTable,
    ) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .trap_on_grow_failure(true)
            .build();
        Self {
            recorder: EffectRecorder::new(sink, config.echo_guest_output, config.max_effects),
            globals: Globals::inject(capabilities),
            handles: HandleTable::new(config.max_handles),
            scheduler: Scheduler::new(),
            limits,
            deadline: None,
        }
    }

    pub fn value(&self, handle: i32) -> Result<&Value, SandboxError> {
        self.handles.get(handle)
    }

    pub fn alloc(&mut self, value: Value) -> Result<i32, SandboxError> {
        self.handles.alloc(value)
    }

    /// The promise behind a handle. Plain values are wrapped in an
    /// already-fulfilled promise.
    pub fn promise_of(&mut self, handle: i32) -> Result<PromiseId, SandboxError> {
        let value = self.handles.get(handle)?.clone();
        Ok(self.scheduler.resolved(value))
    }

    /// The promise behind a handle that must already hold one.
    pub fn expect_promise(&self, handle: i32) -> Result<PromiseId, SandboxError> {
        self.handles
            .get(handle)?
            .as_promise()
            .ok_or(SandboxError::BadHandle(handle))
    }
}

/// How a call into guest code ended, when it did not return normally.
#[derive(Debug)]
pub enum Interrupted {
    /// The guest threw; the caller decides whether that is catchable.
    Thrown(Value),
    /// The run cannot continue.
    Fatal(SandboxError),
}

/// Sort a Wasmtime call error into a guest exception or a fatal fault.
///
/// Host faults come back as [`Fault`]; fuel exhaustion and epoch
/// interruption as [`Trap`]; store limit refusals only by message.
pub fn classify(err: anyhow::Error) -> Interrupted {
    let err = match err.downcast::<Fault>() {
        Ok(Fault::Thrown(value)) => return Interrupted::Thrown(value),
        Ok(Fault::Sandbox(e)) => return Interrupted::Fatal(e),
        Err(err) => err,
    };

    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => return Interrupted::Fatal(SandboxError::FuelExhausted),
        Some(Trap::Interrupt) => return Interrupted::Fatal(SandboxError::Timeout),
        _ => {}
    }

    let msg = format!("{:#}", err);
    if msg.contains("exceeds memory limits")
        || msg.contains("growing memory")
        || msg.contains("memory growth failure")
    {
        let line = msg.lines().next().unwrap_or_default().to_string();
        return Interrupted::Fatal(SandboxError::ResourceLimit(line));
    }
    Interrupted::Fatal(SandboxError::GuestTrapped(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_hostapi::NullSink;

    fn state() -> RunState {
        let caps = CapabilityTable::new().with_value("input", 1);
        RunState::new(&SandboxConfig::default(), Arc::new(NullSink), &caps)
    }

    #[test]
    fn test_handle_zero_is_undefined() {
        let st = state();
        assert_eq!(st.value(0).unwrap(), &Value::Undefined);
        assert!(matches!(st.value(1), Err(SandboxError::BadHandle(1))));
        assert!(matches!(st.value(-3), Err(SandboxError::BadHandle(-3))));
    }

    #[test]
    fn test_undefined_reuses_handle_zero() {
        let mut st = state();
        assert_eq!(st.alloc(Value::Undefined).unwrap(), 0);
        let h = st.alloc(Value::from("x")).unwrap();
        assert_eq!(h, 1);
        assert_eq!(st.handles.len(), 2);
    }

    #[test]
    fn test_handle_limit() {
        let mut table = HandleTable::new(2);
        table.alloc(Value::from(1)).unwrap();
        let err = table.alloc(Value::from(2)).unwrap_err();
        assert!(matches!(err, SandboxError::ResourceLimit(_)));
    }

    #[test]
    fn test_undefined_handle_is_not_writable() {
        let mut table = HandleTable::new(8);
        assert!(table.get_mut(0).is_err());
    }

    #[test]
    fn test_promise_of_wraps_plain_values() {
        let mut st = state();
        let h = st.alloc(Value::from("v")).unwrap();
        let p = st.promise_of(h).unwrap();
        assert_eq!(
            st.scheduler.state(p),
            Some(&crate::scheduler::PromiseState::Fulfilled(Value::from("v")))
        );
        assert!(matches!(st.expect_promise(h), Err(SandboxError::BadHandle(_))));
    }

    #[test]
    fn test_globals_injected_from_baseline() {
        let st = state();
        assert!(st.globals.contains("input"));
    }

    #[test]
    fn test_classify_recovers_faults() {
        let err: anyhow::Error = Fault::Thrown(Value::from("boom")).into();
        assert!(matches!(classify(err), Interrupted::Thrown(Value::String(ref s)) if s == "boom"));

        let err: anyhow::Error = Fault::from(SandboxError::UnboundGlobal {
            name: "sqlSelect".into(),
        })
        .into();
        assert!(matches!(
            classify(err),
            Interrupted::Fatal(SandboxError::UnboundGlobal { .. })
        ));

        let err: anyhow::Error = Trap::OutOfFuel.into();
        assert!(matches!(
            classify(err),
            Interrupted::Fatal(SandboxError::FuelExhausted)
        ));

        let err = anyhow::anyhow!("memory minimum size of 300 pages exceeds memory limits");
        assert!(matches!(
            classify(err),
            Interrupted::Fatal(SandboxError::ResourceLimit(_))
        ));

        let err = anyhow::anyhow!("unreachable");
        assert!(matches!(
            classify(err),
            Interrupted::Fatal(SandboxError::GuestTrapped(_))
        ));
    }
}
