//! Host function registration via Wasmtime linker.
//!
//! Registers every `sandbox` intrinsic with the Wasmtime `Linker`, and one
//! trampoline per `global` capability import. Each function:
//! 1. Reads pointer/length arguments from the caller's exported memory
//! 2. Resolves value handles against the run's handle table
//! 3. Performs the operation
//! 4. Returns a value handle, or unwinds the guest with a [`Fault`]

use wasmtime::{Caller, Linker, Memory};

use keel_hostapi::{abi, HostContext, LogLevel, Value};

use crate::error::SandboxError;
use crate::globals::Lookup;
use crate::host_impl::{Continuation, Fault, RunState};
use crate::memory;

type HostResult<T> = Result<T, Fault>;

/// Get the guest's exported memory from a Caller.
fn get_memory(caller: &mut Caller<'_, RunState>) -> Option<Memory> {
    caller
        .get_export(abi::MEMORY_EXPORT)
        .and_then(|e| e.into_memory())
}

/// Read a UTF-8 string out of the caller's memory.
fn guest_str(caller: &mut Caller<'_, RunState>, ptr: i32, len: i32) -> HostResult<String> {
    let mem = get_memory(caller)
        .ok_or_else(|| SandboxError::BadPointer("caller exports no memory".into()))?;
    Ok(memory::read_str(mem.data(&*caller), ptr, len)?)
}

/// Register all `sandbox` intrinsics with the linker.
pub fn register_intrinsics(linker: &mut Linker<RunState>) -> Result<(), SandboxError> {
    register_output(linker)?;
    register_values(linker)?;
    register_globals(linker)?;
    register_throw(linker)?;
    register_promises(linker)?;
    register_continuations(linker)?;
    Ok(())
}

// ── Output ──

fn register_output(linker: &mut Linker<RunState>) -> Result<(), SandboxError> {
    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::PRINT,
        |mut caller: Caller<'_, RunState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let text = guest_str(&mut caller, ptr, len)?;
            caller
                .data_mut()
                .recorder
                .record_print(&text)
                .map_err(Fault::from)?;
            Ok(())
        },
    )?;

    for (name, level) in [(abi::LOG, LogLevel::Info), (abi::ERROR, LogLevel::Error)] {
        linker.func_wrap(
            abi::SANDBOX_MODULE,
            name,
            move |mut caller: Caller<'_, RunState>, handle: i32| -> anyhow::Result<()> {
                let state = caller.data_mut();
                let message = state.value(handle).map_err(Fault::from)?.to_string();
                state
                    .recorder
                    .record_log(level, &message)
                    .map_err(Fault::from)?;
                Ok(())
            },
        )?;
    }
    Ok(())
}

// ── Values ──

fn register_values(linker: &mut Linker<RunState>) -> Result<(), SandboxError> {
    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::STRING,
        |mut caller: Caller<'_, RunState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let text = guest_str(&mut caller, ptr, len)?;
            Ok(caller
                .data_mut()
                .alloc(Value::String(text))
                .map_err(Fault::from)?)
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::NUMBER,
        |mut caller: Caller<'_, RunState>, n: f64| -> anyhow::Result<i32> {
            Ok(caller
                .data_mut()
                .alloc(Value::Number(n))
                .map_err(Fault::from)?)
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::TO_NUMBER,
        |caller: Caller<'_, RunState>, handle: i32| -> anyhow::Result<f64> {
            Ok(caller.data().value(handle).map_err(Fault::from)?.to_number())
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::CONCAT,
        |mut caller: Caller<'_, RunState>, a: i32, b: i32| -> anyhow::Result<i32> {
            let state = caller.data_mut();
            let joined = format!(
                "{}{}",
                state.value(a).map_err(Fault::from)?,
                state.value(b).map_err(Fault::from)?
            );
            Ok(state.alloc(Value::String(joined)).map_err(Fault::from)?)
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::LIST,
        |mut caller: Caller<'_, RunState>| -> anyhow::Result<i32> {
            Ok(caller
                .data_mut()
                .alloc(Value::List(Vec::new()))
                .map_err(Fault::from)?)
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::PUSH,
        |mut caller: Caller<'_, RunState>, list: i32, item: i32| -> anyhow::Result<()> {
            let state = caller.data_mut();
            let value = state.value(item).map_err(Fault::from)?.clone();
            match state.handles.get_mut(list).map_err(Fault::from)? {
                Value::List(items) => {
                    items.push(value);
                    Ok(())
                }
                _ => Err(Fault::from(SandboxError::BadHandle(list)).into()),
            }
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::ITEM,
        |mut caller: Caller<'_, RunState>, list: i32, index: i32| -> anyhow::Result<i32> {
            let state = caller.data_mut();
            let value = match state.value(list).map_err(Fault::from)? {
                Value::List(items) => usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .unwrap_or_default(),
                _ => Value::Undefined,
            };
            Ok(state.alloc(value).map_err(Fault::from)?)
        },
    )?;
    Ok(())
}

// ── Globals ──

fn register_globals(linker: &mut Linker<RunState>) -> Result<(), SandboxError> {
    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::GLOBAL_GET,
        |mut caller: Caller<'_, RunState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let name = guest_str(&mut caller, ptr, len)?;
            let state = caller.data_mut();
            let value = match state.globals.get(&name).map_err(Fault::from)? {
                Lookup::Value(value) => value,
                Lookup::Function => Value::String(format!("function {}() {{ [native code] }}", name)),
            };
            Ok(state.alloc(value).map_err(Fault::from)?)
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::GLOBAL_SET,
        |mut caller: Caller<'_, RunState>, ptr: i32, len: i32, handle: i32| -> anyhow::Result<()> {
            let name = guest_str(&mut caller, ptr, len)?;
            let state = caller.data_mut();
            let value = state.value(handle).map_err(Fault::from)?.clone();
            state
                .globals
                .set(&name, value.clone())
                .map_err(Fault::from)?;
            state
                .recorder
                .record_global_set(&name, &value)
                .map_err(Fault::from)?;
            Ok(())
        },
    )?;
    Ok(())
}

fn register_throw(linker: &mut Linker<RunState>) -> Result<(), SandboxError> {
    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::THROW,
        |caller: Caller<'_, RunState>, handle: i32| -> anyhow::Result<()> {
            let value = caller.data().value(handle).map_err(Fault::from)?.clone();
            Err(Fault::Thrown(value).into())
        },
    )?;
    Ok(())
}

// ── Promises ──

fn register_promises(linker: &mut Linker<RunState>) -> Result<(), SandboxError> {
    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::PROMISE_NEW,
        |mut caller: Caller<'_, RunState>| -> anyhow::Result<i32> {
            let state = caller.data_mut();
            let id = state.scheduler.create();
            Ok(state.alloc(Value::Promise(id)).map_err(Fault::from)?)
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::PROMISE_RESOLVE,
        |mut caller: Caller<'_, RunState>, handle: i32| -> anyhow::Result<i32> {
            let state = caller.data_mut();
            let id = state.promise_of(handle).map_err(Fault::from)?;
            Ok(state.alloc(Value::Promise(id)).map_err(Fault::from)?)
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::PROMISE_REJECT,
        |mut caller: Caller<'_, RunState>, handle: i32| -> anyhow::Result<i32> {
            let state = caller.data_mut();
            let reason = state.value(handle).map_err(Fault::from)?.clone();
            let id = state.scheduler.rejected(reason);
            Ok(state.alloc(Value::Promise(id)).map_err(Fault::from)?)
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::PROMISE_FULFILL,
        |mut caller: Caller<'_, RunState>, promise: i32, handle: i32| -> anyhow::Result<()> {
            let state = caller.data_mut();
            let id = state.expect_promise(promise).map_err(Fault::from)?;
            let value = state.value(handle).map_err(Fault::from)?.clone();
            state.scheduler.resolve(id, value);
            Ok(())
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::PROMISE_FAIL,
        |mut caller: Caller<'_, RunState>, promise: i32, handle: i32| -> anyhow::Result<()> {
            let state = caller.data_mut();
            let id = state.expect_promise(promise).map_err(Fault::from)?;
            let reason = state.value(handle).map_err(Fault::from)?.clone();
            state.scheduler.reject(id, reason);
            Ok(())
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::PROMISE_ALL,
        |mut caller: Caller<'_, RunState>, list: i32| -> anyhow::Result<i32> {
            let state = caller.data_mut();
            let items = match state.value(list).map_err(Fault::from)? {
                Value::List(items) => items.clone(),
                _ => return Err(Fault::from(SandboxError::BadHandle(list)).into()),
            };
            let operands: Vec<_> = items
                .into_iter()
                .map(|item| state.scheduler.resolved(item))
                .collect();
            let id = state.scheduler.all(&operands);
            Ok(state.alloc(Value::Promise(id)).map_err(Fault::from)?)
        },
    )?;
    Ok(())
}

// ── Continuations ──

/// Resolve a continuation export on the calling instance.
fn continuation(
    caller: &mut Caller<'_, RunState>,
    ptr: i32,
    len: i32,
    env: i32,
) -> HostResult<Continuation> {
    let name = guest_str(caller, ptr, len)?;
    let func = caller
        .get_export(&name)
        .and_then(|e| e.into_func())
        .ok_or_else(|| SandboxError::NotCallable { name: name.clone() })?;
    let func = func
        .typed::<(i32, i32), i32>(&*caller)
        .map_err(|_| SandboxError::NotCallable { name })?;
    let env = caller.data().value(env)?.clone();
    Ok(Continuation { func, env })
}

fn register_continuations(linker: &mut Linker<RunState>) -> Result<(), SandboxError> {
    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::THEN,
        |mut caller: Caller<'_, RunState>,
         promise: i32,
         ptr: i32,
         len: i32,
         env: i32|
         -> anyhow::Result<i32> {
            let k = continuation(&mut caller, ptr, len, env)?;
            let state = caller.data_mut();
            let id = state.promise_of(promise).map_err(Fault::from)?;
            let derived = state.scheduler.then(id, Some(k), None);
            Ok(state.alloc(Value::Promise(derived)).map_err(Fault::from)?)
        },
    )?;

    linker.func_wrap(
        abi::SANDBOX_MODULE,
        abi::CATCH,
        |mut caller: Caller<'_, RunState>,
         promise: i32,
         ptr: i32,
         len: i32,
         env: i32|
         -> anyhow::Result<i32> {
            let k = continuation(&mut caller, ptr, len, env)?;
            let state = caller.data_mut();
            let id = state.promise_of(promise).map_err(Fault::from)?;
            let derived = state.scheduler.then(id, None, Some(k));
            Ok(state.alloc(Value::Promise(derived)).map_err(Fault::from)?)
        },
    )?;
    Ok(())
}

// ── Capabilities ──

/// Bind one `global` import per capability name referenced by the graph.
///
/// The name is resolved against the run's globals on every call, so a
/// missing capability fails at the point of use, not at link time.
pub fn bind_capabilities<'a>(
    linker: &mut Linker<RunState>,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(), SandboxError> {
    for import in names {
        let name = import.to_string();
        linker.func_wrap(
            abi::GLOBAL_MODULE,
            import,
            move |mut caller: Caller<'_, RunState>, args: i32| -> anyhow::Result<i32> {
                let state = caller.data_mut();
                let func = state.globals.function(&name).map_err(Fault::from)?;
                let args = match state.value(args).map_err(Fault::from)? {
                    Value::List(items) => items.clone(),
                    Value::Undefined => Vec::new(),
                    other => vec![other.clone()],
                };

                let ctx: &mut dyn HostContext = &mut state.recorder;
                let result = (*func)(ctx, &args);
                if state.recorder.take_overflow() {
                    return Err(Fault::from(SandboxError::ResourceLimit(format!(
                        "effect log limit reached in '{}'",
                        name
                    )))
                    .into());
                }

                match result {
                    Ok(value) => Ok(state.alloc(value).map_err(Fault::from)?),
                    Err(e) => Err(Fault::Thrown(e.to_value()).into()),
                }
            },
        )?;
    }
    Ok(())
}
