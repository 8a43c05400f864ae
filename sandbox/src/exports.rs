//! Export surface of an entry module.
//!
//! The set of export names is fixed when the module is linked. Values are
//! read live from the running instance, never snapshotted.

use wasmtime::{ExternType, Module};

use keel_hostapi::abi;

/// Kind of an exported binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// A guest function with its parameter and result counts.
    Function { params: usize, results: usize },
    /// A global binding; `i32` globals hold value handles.
    Global { mutable: bool },
    Table,
    Memory,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDecl {
    pub name: String,
    pub kind: ExportKind,
}

/// Declared export bindings of one module, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSurface {
    specifier: String,
    exports: Vec<ExportDecl>,
}

impl ExportSurface {
    /// Enumerate a compiled module's exports without running it. The
    /// ABI-mandated memory export is not part of the surface.
    pub fn from_module(specifier: &str, module: &Module) -> Self {
        let exports = module
            .exports()
            .filter(|e| e.name() != abi::MEMORY_EXPORT)
            .map(|e| ExportDecl {
                name: e.name().to_string(),
                kind: match e.ty() {
                    ExternType::Func(ft) => ExportKind::Function {
                        params: ft.params().len(),
                        results: ft.results().len(),
                    },
                    ExternType::Global(gt) => ExportKind::Global {
                        mutable: gt.mutability() == wasmtime::Mutability::Var,
                    },
                    ExternType::Table(_) => ExportKind::Table,
                    ExternType::Memory(_) => ExportKind::Memory,
                    _ => ExportKind::Other,
                },
            })
            .collect();
        Self {
            specifier: specifier.to_string(),
            exports,
        }
    }

    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    pub fn names(&self) -> Vec<&str> {
        self.exports.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ExportDecl> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExportDecl> {
        self.exports.iter()
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}
