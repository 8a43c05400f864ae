//! Sandbox runtime — Wasmtime engine, module graph loading, and runs.
//!
//! The `Sandbox` struct is the main entry point. It loads and links a guest
//! module graph through the host's resolver, then executes it against a
//! capability table:
//!
//! 1. Inject the capability baseline into fresh per-run state
//! 2. Register intrinsics and bind every `global` import
//! 3. Instantiate modules dependencies-first, running each start function
//! 4. Drain the scheduler, running guest continuations in queue order
//! 5. Fail on an unhandled rejection, otherwise settle
//!
//! Every run gets its own `Store`, so nothing carries over between runs.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use wasmtime::{Config, Engine, Instance, Linker, Store, Trap, UpdateDeadline, Val, ValType};

use keel_hostapi::{
    CapabilityTable, EffectKind, EffectLog, ErrorKind, NullSink, PrintSink, SourceResolver, Value,
};

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SourceLocation};
use crate::exports::ExportSurface;
use crate::host_impl::{classify, Continuation, Interrupted, RunState};
use crate::lifecycle::ExecutionState;
use crate::linker::{bind_capabilities, register_intrinsics};
use crate::loader::{load_graph, ModuleGraph};
use crate::scheduler::{PromiseState, Task};

/// Specifier under which `execute_source` registers its inline entry.
pub const INLINE_SPECIFIER: &str = "<inline>";

/// The guest script sandbox.
///
/// Holds one engine for all runs. Loading is separate from running, so a
/// `Program` can be started any number of times with fresh state.
pub struct Sandbox {
    engine: Engine,
    resolver: Arc<dyn SourceResolver>,
    sink: Arc<dyn PrintSink>,
    config: SandboxConfig,
}

impl Sandbox {
    /// Create a sandbox that loads modules through `resolver`.
    pub fn new(
        resolver: impl SourceResolver + 'static,
        config: SandboxConfig,
    ) -> Result<Self, SandboxError> {
        let engine = create_engine(&config)?;
        Ok(Self {
            engine,
            resolver: Arc::new(resolver),
            sink: Arc::new(NullSink),
            config,
        })
    }

    /// Destination for guest output when `echo_guest_output` is set.
    pub fn with_sink(mut self, sink: Arc<dyn PrintSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Resolve, compile, validate and link the graph rooted at `entry`.
    /// No guest code runs.
    pub fn load(&self, entry: &str) -> Result<Program, SandboxError> {
        self.load_with(&*self.resolver, entry)
    }

    fn load_with(
        &self,
        resolver: &dyn SourceResolver,
        entry: &str,
    ) -> Result<Program, SandboxError> {
        let graph = load_graph(&self.engine, resolver, entry)?;
        Ok(Program {
            engine: self.engine.clone(),
            graph,
            config: self.config.clone(),
            sink: self.sink.clone(),
        })
    }

    /// Load and run `entry` with `capabilities`.
    ///
    /// Never fails: load and link errors produce a `Failed` result whose
    /// effect log holds only the abort record.
    pub fn execute(&self, entry: &str, capabilities: &CapabilityTable) -> RunResult {
        match self.load(entry) {
            Ok(program) => RunResult::Executed(program.start(capabilities)),
            Err(err) => RunResult::aborted(&err),
        }
    }

    /// Run inline module source as the entry. Its relative imports resolve
    /// against the sandbox's resolver root.
    pub fn execute_source(
        &self,
        source: impl Into<Vec<u8>>,
        capabilities: &CapabilityTable,
    ) -> RunResult {
        let resolver = InlineResolver {
            source: source.into(),
            inner: self.resolver.clone(),
        };
        match self.load_with(&resolver, INLINE_SPECIFIER) {
            Ok(program) => RunResult::Executed(program.start(capabilities)),
            Err(err) => RunResult::aborted(&err),
        }
    }
}

/// Serves the inline entry, delegating everything else.
struct InlineResolver {
    source: Vec<u8>,
    inner: Arc<dyn SourceResolver>,
}

impl SourceResolver for InlineResolver {
    fn resolve(&self, specifier: &str) -> Result<Option<Vec<u8>>, keel_hostapi::HostError> {
        if specifier == INLINE_SPECIFIER {
            return Ok(Some(self.source.clone()));
        }
        self.inner.resolve(specifier)
    }
}

/// A linked module graph, ready to run.
pub struct Program {
    engine: Engine,
    graph: ModuleGraph,
    config: SandboxConfig,
    sink: Arc<dyn PrintSink>,
}

impl Program {
    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    /// Declared exports of the entry module, known since linking.
    pub fn exports(&self) -> ExportSurface {
        self.graph
            .entry()
            .map(|m| m.exports.clone())
            .unwrap_or_default()
    }

    /// Run the program once with a fresh injection of `capabilities`.
    pub fn start(&self, capabilities: &CapabilityTable) -> Execution {
        let state = RunState::new(&self.config, self.sink.clone(), capabilities);
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);

        let mut execution = Execution {
            state: ExecutionState::Loaded,
            failure: None,
            store,
            entry: None,
            surface: self.exports(),
            engine: self.engine.clone(),
            timeout: self.config.timeout,
            fuel_limit: self.config.fuel_limit,
        };

        if let Err(e) = execution.store.set_fuel(self.config.fuel_limit) {
            execution.fail(e.into());
            return execution;
        }
        if self.config.timeout.is_some() {
            execution.store.set_epoch_deadline(1);
            execution.store.epoch_deadline_callback(|ctx| match ctx.data().deadline {
                Some(deadline) if Instant::now() >= deadline => Err(Trap::Interrupt.into()),
                _ => Ok(UpdateDeadline::Continue(1)),
            });
        }

        let watchdog = execution.arm_timeout();
        let outcome = execution.link_and_run(&self.graph);
        drop(watchdog);
        execution.store.data_mut().deadline = None;

        if let Err(err) = outcome {
            execution.fail(err);
        }
        execution
    }
}

/// How a run ended, as reported to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<SourceLocation>,
}

impl From<&SandboxError> for Failure {
    fn from(err: &SandboxError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            location: err.location(),
        }
    }
}

/// One run of a program.
pub struct Execution {
    state: ExecutionState,
    failure: Option<Failure>,
    store: Store<RunState>,
    entry: Option<Instance>,
    surface: ExportSurface,
    engine: Engine,
    timeout: Option<Duration>,
    fuel_limit: u64,
}

impl Execution {
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// The run's effect log. Readable once the run is terminal.
    pub fn effects(&self) -> Result<&EffectLog, SandboxError> {
        if !self.state.is_terminal() {
            return Err(SandboxError::NotReady { state: self.state });
        }
        Ok(self.store.data().recorder.effects())
    }

    /// Declared exports of the entry module.
    pub fn exports(&self) -> Result<&ExportSurface, SandboxError> {
        self.ensure_settled()?;
        Ok(&self.surface)
    }

    /// Read the current value of an export. Globals are re-read on every
    /// call; an `i32` global is a value handle.
    pub fn read_export(&mut self, name: &str) -> Result<Value, SandboxError> {
        let instance = self.settled_entry(name)?;
        let value = match instance.get_export(&mut self.store, name) {
            Some(wasmtime::Extern::Global(global)) => match global.get(&mut self.store) {
                Val::I32(handle) => self.store.data().value(handle)?.clone(),
                Val::I64(n) => Value::Number(n as f64),
                Val::F32(bits) => Value::Number(f32::from_bits(bits) as f64),
                Val::F64(bits) => Value::Number(f64::from_bits(bits)),
                _ => Value::Undefined,
            },
            Some(wasmtime::Extern::Func(_)) => {
                Value::String(format!("function {}() {{ [native code] }}", name))
            }
            _ => Value::Undefined,
        };
        Ok(value)
    }

    /// Call an exported function with `args`. Each call starts with a full
    /// fuel allowance and drains every continuation it queues.
    ///
    /// The export takes no parameters or one argument-list handle, and
    /// returns nothing or one value handle. A returned promise is driven
    /// until it settles: fulfilment gives its value, rejection gives
    /// `Rejected`, and a promise left pending gives `Unsettled`.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, SandboxError> {
        let instance = self.settled_entry(name)?;
        let func = instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| SandboxError::NotCallable {
                name: name.to_string(),
            })?;

        let ty = func.ty(&self.store);
        let param_types: Vec<ValType> = ty.params().collect();
        let result_count = ty.results().len();
        let handle_ok = |types: &[ValType]| types.iter().all(|t| matches!(t, ValType::I32));
        let result_types: Vec<ValType> = ty.results().collect();
        if param_types.len() > 1
            || result_count > 1
            || !handle_ok(&param_types)
            || !handle_ok(&result_types)
        {
            return Err(SandboxError::NotCallable {
                name: name.to_string(),
            });
        }

        let mut params = Vec::with_capacity(1);
        if !param_types.is_empty() {
            let list = self.store.data_mut().alloc(Value::List(args.to_vec()))?;
            params.push(Val::I32(list));
        }
        let mut results = vec![Val::I32(0); result_count];

        log::debug!("calling export '{}'", name);
        self.store.set_fuel(self.fuel_limit)?;
        let watchdog = self.arm_timeout();
        let outcome = self.invoke(name, func, &params, &mut results);
        drop(watchdog);
        self.store.data_mut().deadline = None;

        if let Err(err) = &outcome {
            self.store
                .data_mut()
                .recorder
                .record_error(err.kind(), &err.to_string(), false);
        }
        outcome
    }

    fn invoke(
        &mut self,
        name: &str,
        func: wasmtime::Func,
        params: &[Val],
        results: &mut [Val],
    ) -> Result<Value, SandboxError> {
        let called = func.call(&mut self.store, params, results).map_err(uncaught);
        let drained = called.and_then(|_| self.drain());
        if let Err(err) = drained {
            self.store.data_mut().scheduler.clear_queue();
            return Err(err);
        }
        let value = match results.first() {
            Some(Val::I32(handle)) => self.store.data().value(*handle)?.clone(),
            _ => Value::Undefined,
        };

        let scheduler = &mut self.store.data_mut().scheduler;
        if let Value::Promise(id) = value {
            scheduler.mark_handled(id);
        }
        if let Some(reason) = scheduler.take_unhandled() {
            return Err(SandboxError::UnhandledRejection {
                reason: reason.to_string(),
            });
        }
        let Value::Promise(id) = value else {
            return Ok(value);
        };
        match scheduler.state(id) {
            Some(PromiseState::Fulfilled(value)) => Ok(value.clone()),
            Some(PromiseState::Rejected(reason)) => Err(SandboxError::Rejected {
                reason: reason.to_string(),
            }),
            _ => Err(SandboxError::Unsettled {
                name: name.to_string(),
            }),
        }
    }

    /// Run queued continuations until the queue is empty.
    fn drain(&mut self) -> Result<(), SandboxError> {
        while let Some(task) = self.store.data_mut().scheduler.poll() {
            run_task(&mut self.store, task)?;
        }
        Ok(())
    }

    fn ensure_settled(&self) -> Result<(), SandboxError> {
        if self.state != ExecutionState::Settled {
            return Err(SandboxError::NotReady { state: self.state });
        }
        Ok(())
    }

    fn settled_entry(&self, name: &str) -> Result<Instance, SandboxError> {
        self.ensure_settled()?;
        if !self.surface.contains(name) {
            return Err(SandboxError::UnknownExport {
                name: name.to_string(),
            });
        }
        self.entry
            .ok_or(SandboxError::NotReady { state: self.state })
    }

    fn link_and_run(&mut self, graph: &ModuleGraph) -> Result<(), SandboxError> {
        let mut base = Linker::new(&self.engine);
        register_intrinsics(&mut base)?;
        bind_capabilities(&mut base, graph.capability_names())?;
        self.state.advance(ExecutionState::Linked)?;

        self.state.advance(ExecutionState::Running)?;
        let mut instances: Vec<Instance> = Vec::with_capacity(graph.len());
        for module in graph.modules() {
            let mut linker = base.clone();
            for (raw, dep) in &module.imports {
                linker.instance(&mut self.store, raw, instances[*dep])?;
            }
            log::debug!("running top-level code of '{}'", module.specifier);
            let instance = linker
                .instantiate(&mut self.store, &module.module)
                .map_err(uncaught)?;
            instances.push(instance);
        }
        self.entry = instances.last().copied();

        self.settle()
    }

    /// Drain the job queue, then decide between `Settled` and `Failed`.
    fn settle(&mut self) -> Result<(), SandboxError> {
        while let Some(task) = self.store.data_mut().scheduler.poll() {
            self.state.advance(ExecutionState::Suspended)?;
            self.state.advance(ExecutionState::Running)?;
            run_task(&mut self.store, task)?;
        }

        let scheduler = &self.store.data().scheduler;
        if let Some((_, reason)) = scheduler.unhandled() {
            return Err(SandboxError::UnhandledRejection {
                reason: reason.to_string(),
            });
        }
        let abandoned = scheduler.pending_count();
        if abandoned > 0 {
            log::debug!("settled with {} promise(s) still pending", abandoned);
        }
        self.state.advance(ExecutionState::Settled)
    }

    fn fail(&mut self, err: SandboxError) {
        log::warn!("run failed: {}", err);
        self.store
            .data_mut()
            .recorder
            .record_error(err.kind(), &err.to_string(), false);
        self.failure = Some(Failure::from(&err));
        if self.state.can_transition(ExecutionState::Failed) {
            self.state = ExecutionState::Failed;
        }
    }

    fn arm_timeout(&mut self) -> Option<Watchdog> {
        let timeout = self.timeout?;
        self.store.data_mut().deadline = Some(Instant::now() + timeout);
        Some(Watchdog::arm(&self.engine, timeout))
    }
}

/// Run one continuation and settle its derived promise with the outcome.
/// A guest exception rejects the derived promise; faults end the run.
fn run_task(store: &mut Store<RunState>, task: Task<Continuation>) -> Result<(), SandboxError> {
    let Task {
        continuation,
        argument,
        derived,
        rejected,
    } = task;
    let state = store.data_mut();
    if rejected {
        state
            .recorder
            .record_error(ErrorKind::Thrown, &argument.to_string(), true);
    }
    let arg = state.alloc(argument)?;
    let env = state.alloc(continuation.env)?;

    match continuation.func.call(&mut *store, (arg, env)) {
        Ok(handle) => {
            let value = store.data().value(handle)?.clone();
            store.data_mut().scheduler.resolve(derived, value);
            Ok(())
        }
        Err(err) => match classify(err) {
            Interrupted::Thrown(reason) => {
                store.data_mut().scheduler.reject(derived, reason);
                Ok(())
            }
            Interrupted::Fatal(e) => Err(e),
        },
    }
}

/// Errors escaping guest code called directly by the host.
fn uncaught(err: anyhow::Error) -> SandboxError {
    match classify(err) {
        Interrupted::Thrown(value) => SandboxError::Uncaught {
            value: value.to_string(),
        },
        Interrupted::Fatal(e) => e,
    }
}

/// Bumps the engine epoch once the timeout has passed, then keeps ticking
/// until dropped so the run's deadline check fires promptly.
struct Watchdog {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    fn arm(engine: &Engine, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let engine = engine.clone();
        let handle = thread::spawn(move || {
            let mut wait = timeout;
            loop {
                match rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {
                        engine.increment_epoch();
                        wait = Duration::from_millis(1);
                    }
                    _ => break,
                }
            }
        });
        Self {
            stop: Some(tx),
            handle: Some(handle),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The result of `Sandbox::execute`.
pub enum RunResult {
    /// Loading or linking failed; no guest code ran.
    Aborted { failure: Failure, effects: EffectLog },
    Executed(Execution),
}

impl RunResult {
    fn aborted(err: &SandboxError) -> Self {
        log::warn!("run aborted: {}", err);
        let mut effects = EffectLog::new();
        effects.append(EffectKind::Error {
            kind: err.kind(),
            message: err.to_string(),
            caught: false,
        });
        Self::Aborted {
            failure: Failure::from(err),
            effects,
        }
    }

    pub fn state(&self) -> ExecutionState {
        match self {
            Self::Aborted { .. } => ExecutionState::Failed,
            Self::Executed(execution) => execution.state(),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state() == ExecutionState::Settled
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Aborted { failure, .. } => Some(failure),
            Self::Executed(execution) => execution.failure(),
        }
    }

    /// The effect log. Runs returned by `execute` are always terminal.
    pub fn effects(&self) -> &EffectLog {
        match self {
            Self::Aborted { effects, .. } => effects,
            Self::Executed(execution) => execution.store.data().recorder.effects(),
        }
    }

    pub fn exports(&self) -> Result<&ExportSurface, SandboxError> {
        match self {
            Self::Aborted { .. } => Err(SandboxError::NotReady {
                state: ExecutionState::Failed,
            }),
            Self::Executed(execution) => execution.exports(),
        }
    }

    pub fn read_export(&mut self, name: &str) -> Result<Value, SandboxError> {
        self.execution_mut()?.read_export(name)
    }

    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, SandboxError> {
        self.execution_mut()?.call(name, args)
    }

    pub fn execution(&self) -> Option<&Execution> {
        match self {
            Self::Aborted { .. } => None,
            Self::Executed(execution) => Some(execution),
        }
    }

    fn execution_mut(&mut self) -> Result<&mut Execution, SandboxError> {
        match self {
            Self::Aborted { .. } => Err(SandboxError::NotReady {
                state: ExecutionState::Failed,
            }),
            Self::Executed(execution) => Ok(execution),
        }
    }
}

/// Create a Wasmtime engine with deterministic configuration.
fn create_engine(config: &SandboxConfig) -> Result<Engine, SandboxError> {
    let mut wasm_config = Config::new();

    // Fuel metering — prevents infinite loops
    wasm_config.consume_fuel(true);

    // Wall-clock limits need epoch checks compiled in
    wasm_config.epoch_interruption(config.timeout.is_some());

    // Determinism enforcement
    wasm_config.wasm_threads(false);
    wasm_config.wasm_simd(false);
    wasm_config.wasm_relaxed_simd(false);
    wasm_config.wasm_multi_memory(false);
    wasm_config.cranelift_nan_canonicalization(true);

    Ok(Engine::new(&wasm_config)?)
}
