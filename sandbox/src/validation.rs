//! WASM module validation — guest ABI checks.
//!
//! Validates that a compiled guest module can be linked by the sandbox.
//! Checks:
//!
//! 1. `memory` export present
//! 2. No WASI imports
//! 3. `sandbox` imports are known intrinsics with the right signatures
//! 4. `global` imports are functions typed `(i32) -> i32`
//!
//! Imports from any other module name are guest imports and are checked
//! when the dependency is linked.

use wasmtime::{ExternType, FuncType, Module, ValType};

use keel_hostapi::abi;

use crate::error::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    I32,
    F64,
}

fn matches_ty(vt: &ValType, ty: Ty) -> bool {
    match ty {
        Ty::I32 => matches!(vt, ValType::I32),
        Ty::F64 => matches!(vt, ValType::F64),
    }
}

use Ty::{F64, I32};

/// Intrinsic signatures: (name, params, results).
const INTRINSICS: &[(&str, &[Ty], &[Ty])] = &[
    (abi::PRINT, &[I32, I32], &[]),
    (abi::LOG, &[I32], &[]),
    (abi::ERROR, &[I32], &[]),
    (abi::STRING, &[I32, I32], &[I32]),
    (abi::NUMBER, &[F64], &[I32]),
    (abi::TO_NUMBER, &[I32], &[F64]),
    (abi::CONCAT, &[I32, I32], &[I32]),
    (abi::LIST, &[], &[I32]),
    (abi::PUSH, &[I32, I32], &[]),
    (abi::ITEM, &[I32, I32], &[I32]),
    (abi::GLOBAL_GET, &[I32, I32], &[I32]),
    (abi::GLOBAL_SET, &[I32, I32, I32], &[]),
    (abi::THROW, &[I32], &[]),
    (abi::PROMISE_NEW, &[], &[I32]),
    (abi::PROMISE_RESOLVE, &[I32], &[I32]),
    (abi::PROMISE_REJECT, &[I32], &[I32]),
    (abi::PROMISE_FULFILL, &[I32, I32], &[]),
    (abi::PROMISE_FAIL, &[I32, I32], &[]),
    (abi::PROMISE_ALL, &[I32], &[I32]),
    (abi::THEN, &[I32, I32, I32, I32], &[I32]),
    (abi::CATCH, &[I32, I32, I32, I32], &[I32]),
];

/// Signature of every `global` import and of continuation-free exported
/// calls: argument-list handle in, result handle out.
const CAPABILITY_SIG: (&[Ty], &[Ty]) = (&[I32], &[I32]);

fn signature_matches(func_ty: &FuncType, params: &[Ty], results: &[Ty]) -> bool {
    let actual_params: Vec<ValType> = func_ty.params().collect();
    let actual_results: Vec<ValType> = func_ty.results().collect();
    actual_params.len() == params.len()
        && actual_results.len() == results.len()
        && actual_params.iter().zip(params).all(|(vt, ty)| matches_ty(vt, *ty))
        && actual_results.iter().zip(results).all(|(vt, ty)| matches_ty(vt, *ty))
}

fn describe(params: &[Ty], results: &[Ty]) -> String {
    let fmt = |tys: &[Ty]| {
        tys.iter()
            .map(|t| match t {
                Ty::I32 => "i32",
                Ty::F64 => "f64",
            })
            .collect::<Vec<_>>()
            .join(" ")
    };
    format!("(param {}) (result {})", fmt(params), fmt(results))
}

/// Validate that a guest module meets the sandbox ABI.
pub fn validate_module(module: &Module) -> Result<(), SandboxError> {
    validate_exports(module)?;
    validate_imports(module)?;
    Ok(())
}

fn validate_exports(module: &Module) -> Result<(), SandboxError> {
    let has_memory = module
        .exports()
        .any(|e| e.name() == abi::MEMORY_EXPORT && matches!(e.ty(), ExternType::Memory(_)));
    if !has_memory {
        return Err(SandboxError::ValidationError(format!(
            "module must export '{}'",
            abi::MEMORY_EXPORT
        )));
    }
    Ok(())
}

fn validate_imports(module: &Module) -> Result<(), SandboxError> {
    for import in module.imports() {
        let module_name = import.module();
        let name = import.name();

        if module_name.starts_with("wasi") {
            return Err(SandboxError::ValidationError(format!(
                "WASI import not allowed: {}::{}",
                module_name, name
            )));
        }

        if !abi::is_guest_specifier(module_name) {
            let func_ty = match import.ty() {
                ExternType::Func(ft) => ft,
                _ => {
                    return Err(SandboxError::ValidationError(format!(
                        "non-function import not allowed: {}::{}",
                        module_name, name
                    )));
                }
            };

            let (params, results) = if module_name == abi::SANDBOX_MODULE {
                match INTRINSICS.iter().find(|(n, _, _)| *n == name) {
                    Some(&(_, params, results)) => (params, results),
                    None => {
                        return Err(SandboxError::ValidationError(format!(
                            "unknown intrinsic: {}::{}",
                            module_name, name
                        )));
                    }
                }
            } else {
                CAPABILITY_SIG
            };

            if !signature_matches(&func_ty, params, results) {
                return Err(SandboxError::ValidationError(format!(
                    "import {}::{} has wrong signature, expected {}",
                    module_name,
                    name,
                    describe(params, results)
                )));
            }
        }
    }

    Ok(())
}
