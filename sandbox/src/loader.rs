//! Module loader — resolves and links a guest module graph.
//!
//! Starting from an entry specifier, every guest import is resolved through
//! the host's `SourceResolver`, compiled, validated and recorded without
//! running any guest code. Each resolved specifier is compiled once; a
//! specifier reached again while its own imports are still being walked
//! is a cycle.
//!
//! The resulting `ModuleGraph` lists modules in post-order, so
//! instantiating them front to back always finds dependencies ready.

use std::collections::HashMap;

use wasmtime::{Engine, Module};

use keel_hostapi::{abi, SourceResolver};

use crate::error::{SandboxError, SourceLocation};
use crate::exports::ExportSurface;
use crate::validation::validate_module;

/// A compiled, validated module and its static linkage.
pub struct LinkedModule {
    /// Resolved specifier.
    pub specifier: String,
    pub module: Module,
    /// Guest imports in first-use order: raw specifier as written in the
    /// module, and the dependency's index in the graph.
    pub imports: Vec<(String, usize)>,
    /// Capability names this module imports from `global`.
    pub capabilities: Vec<String>,
    pub exports: ExportSurface,
}

pub struct ModuleGraph {
    modules: Vec<LinkedModule>,
}

impl ModuleGraph {
    /// Modules in instantiation order; the entry module is last.
    pub fn modules(&self) -> &[LinkedModule] {
        &self.modules
    }

    pub fn entry(&self) -> Option<&LinkedModule> {
        self.modules.last()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Every capability name imported anywhere in the graph, de-duplicated
    /// in first-use order.
    pub fn capability_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for module in &self.modules {
            for name in &module.capabilities {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// Load the graph rooted at `entry`.
pub fn load_graph(
    engine: &Engine,
    resolver: &dyn SourceResolver,
    entry: &str,
) -> Result<ModuleGraph, SandboxError> {
    let mut builder = GraphBuilder {
        engine,
        resolver,
        modules: Vec::new(),
        index: HashMap::new(),
        visiting: Vec::new(),
    };
    builder.visit(None, entry, entry.to_string())?;
    log::debug!(
        "linked '{}' with {} module(s)",
        entry,
        builder.modules.len()
    );
    Ok(ModuleGraph {
        modules: builder.modules,
    })
}

struct GraphBuilder<'a> {
    engine: &'a Engine,
    resolver: &'a dyn SourceResolver,
    modules: Vec<LinkedModule>,
    index: HashMap<String, usize>,
    visiting: Vec<String>,
}

impl GraphBuilder<'_> {
    fn visit(
        &mut self,
        importer: Option<&str>,
        raw: &str,
        specifier: String,
    ) -> Result<usize, SandboxError> {
        if let Some(&idx) = self.index.get(&specifier) {
            return Ok(idx);
        }
        if let Some(pos) = self.visiting.iter().position(|s| *s == specifier) {
            let mut cycle = self.visiting[pos..].to_vec();
            cycle.push(specifier);
            return Err(SandboxError::CyclicImport { cycle });
        }

        let source = self
            .resolver
            .resolve(&specifier)?
            .ok_or_else(|| SandboxError::UnresolvedImport {
                importer: importer.map(str::to_string),
                specifier: raw.to_string(),
            })?;
        let module = compile(self.engine, &specifier, &source)?;
        validate_module(&module)?;
        log::debug!("compiled '{}'", specifier);

        let mut raw_imports: Vec<String> = Vec::new();
        let mut capabilities: Vec<String> = Vec::new();
        for import in module.imports() {
            let name = import.module();
            if name == abi::GLOBAL_MODULE {
                if !capabilities.iter().any(|c| c == import.name()) {
                    capabilities.push(import.name().to_string());
                }
            } else if abi::is_guest_specifier(name) && !raw_imports.iter().any(|r| r == name) {
                raw_imports.push(name.to_string());
            }
        }

        self.visiting.push(specifier.clone());
        let mut imports = Vec::with_capacity(raw_imports.len());
        for raw in raw_imports {
            let resolved = resolve_specifier(&specifier, &raw);
            let idx = self.visit(Some(&specifier), &raw, resolved)?;
            imports.push((raw, idx));
        }
        self.visiting.pop();

        check_named_imports(&specifier, &module, &imports, &self.modules)?;

        let exports = ExportSurface::from_module(&specifier, &module);
        let idx = self.modules.len();
        self.modules.push(LinkedModule {
            specifier: specifier.clone(),
            module,
            imports,
            capabilities,
            exports,
        });
        self.index.insert(specifier, idx);
        Ok(idx)
    }
}

/// Every name a module imports from a guest dependency must be exported
/// by it.
fn check_named_imports(
    specifier: &str,
    module: &Module,
    imports: &[(String, usize)],
    modules: &[LinkedModule],
) -> Result<(), SandboxError> {
    for import in module.imports() {
        let Some(&(_, dep)) = imports.iter().find(|(raw, _)| raw == import.module()) else {
            continue;
        };
        let dep = &modules[dep];
        if dep.module.get_export(import.name()).is_none() {
            return Err(SandboxError::ValidationError(format!(
                "'{}' imports '{}' from '{}', which does not export it",
                specifier,
                import.name(),
                dep.specifier
            )));
        }
    }
    Ok(())
}

/// Resolve `raw` as written in `importer`. Relative specifiers join the
/// importer's directory; anything else is taken verbatim.
pub fn resolve_specifier(importer: &str, raw: &str) -> String {
    if !(raw.starts_with("./") || raw.starts_with("../")) {
        return raw.to_string();
    }
    let base = match importer.rfind('/') {
        Some(pos) => &importer[..pos],
        None => "",
    };

    let mut parts: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(raw.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(&p) if p != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if importer.starts_with('/') {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Compile module source, mapping failures to `Parse` with a location when
/// the engine reports one.
fn compile(engine: &Engine, specifier: &str, source: &[u8]) -> Result<Module, SandboxError> {
    Module::new(engine, source).map_err(|err| {
        let text = format!("{:#}", err);
        SandboxError::Parse {
            specifier: specifier.to_string(),
            message: text.lines().next().unwrap_or_default().trim().to_string(),
            location: parse_location(&text),
        }
    })
}

/// Extract a location from an engine error message: `--> file:line:col`
/// for text input, `(at offset 0x..)` for binary input.
pub fn parse_location(message: &str) -> Option<SourceLocation> {
    if let Some(pos) = message.find("--> ") {
        let rest = &message[pos + 4..];
        let spot = rest.lines().next().unwrap_or_default().trim();
        let mut fields = spot.rsplitn(3, ':');
        let column = fields.next()?.parse().ok()?;
        let line = fields.next()?.parse().ok()?;
        return Some(SourceLocation::LineCol { line, column });
    }
    if let Some(pos) = message.find("at offset 0x") {
        let rest = &message[pos + "at offset 0x".len()..];
        let hex: String = rest.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
        return usize::from_str_radix(&hex, 16)
            .ok()
            .map(SourceLocation::Offset);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_hostapi::MemResolver;

    const LEAF: &str = r#"(module (memory (export "memory") 1) (func (export "f")))"#;

    fn importing(dep: &str) -> String {
        format!(
            r#"(module (import "{}" "f" (func)) (memory (export "memory") 1) (func (export "f")))"#,
            dep
        )
    }

    #[test]
    fn test_resolve_specifier() {
        assert_eq!(resolve_specifier("main.wat", "./lib.wat"), "lib.wat");
        assert_eq!(resolve_specifier("app/main.wat", "./lib.wat"), "app/lib.wat");
        assert_eq!(resolve_specifier("app/sub/main.wat", "../lib.wat"), "app/lib.wat");
        assert_eq!(resolve_specifier("main.wat", "../lib.wat"), "../lib.wat");
        assert_eq!(resolve_specifier("/srv/main.wat", "./x/./y.wat"), "/srv/x/y.wat");
        assert_eq!(resolve_specifier("app/main.wat", "shared/util.wat"), "shared/util.wat");
    }

    #[test]
    fn test_parse_location_text() {
        let msg = "expected `(`\n     --> <anon>:3:17\n      |\n    3 |   oops";
        assert_eq!(
            parse_location(msg),
            Some(SourceLocation::LineCol { line: 3, column: 17 })
        );
    }

    #[test]
    fn test_parse_location_binary() {
        let msg = "failed to parse WebAssembly module: unexpected end (at offset 0x1f)";
        assert_eq!(parse_location(msg), Some(SourceLocation::Offset(0x1f)));
        assert_eq!(parse_location("no location here"), None);
    }

    #[test]
    fn test_load_orders_dependencies_first() {
        let resolver = MemResolver::new()
            .with_module("main.wat", importing("./lib.wat"))
            .with_module("lib.wat", LEAF);
        let graph = load_graph(&Engine::default(), &resolver, "main.wat").unwrap();
        let order: Vec<_> = graph.modules().iter().map(|m| m.specifier.as_str()).collect();
        assert_eq!(order, vec!["lib.wat", "main.wat"]);
        assert_eq!(graph.entry().unwrap().imports, vec![("./lib.wat".to_string(), 0)]);
    }

    #[test]
    fn test_shared_dependency_compiled_once() {
        let resolver = MemResolver::new()
            .with_module(
                "main.wat",
                r#"(module
                    (import "./a.wat" "f" (func))
                    (import "./b.wat" "f" (func))
                    (memory (export "memory") 1))"#,
            )
            .with_module("a.wat", importing("./shared.wat"))
            .with_module("b.wat", importing("shared.wat"))
            .with_module("shared.wat", LEAF);
        let graph = load_graph(&Engine::default(), &resolver, "main.wat").unwrap();
        assert_eq!(graph.len(), 4);
        let find = |name: &str| graph.modules().iter().find(|m| m.specifier == name).unwrap();
        let (a, b) = (find("a.wat"), find("b.wat"));
        assert_eq!(a.imports[0].1, b.imports[0].1);
    }

    #[test]
    fn test_cycle_is_named() {
        let resolver = MemResolver::new()
            .with_module("a.wat", importing("./b.wat"))
            .with_module("b.wat", importing("./c.wat"))
            .with_module("c.wat", importing("./b.wat"));
        let err = load_graph(&Engine::default(), &resolver, "a.wat")
            .err()
            .unwrap();
        match err {
            SandboxError::CyclicImport { cycle } => {
                assert_eq!(cycle, vec!["b.wat", "c.wat", "b.wat"]);
            }
            other => panic!("expected CyclicImport, got {:?}", other),
        }
    }

    #[test]
    fn test_self_import_is_a_cycle() {
        let resolver = MemResolver::new().with_module("a.wat", importing("./a.wat"));
        let err = load_graph(&Engine::default(), &resolver, "a.wat")
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::CyclicImport { ref cycle } if cycle.len() == 2));
    }

    #[test]
    fn test_unresolved_names_importer() {
        let resolver = MemResolver::new().with_module("main.wat", importing("./missing.wat"));
        let err = load_graph(&Engine::default(), &resolver, "main.wat")
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SandboxError::UnresolvedImport { importer: Some(ref i), ref specifier }
                if i == "main.wat" && specifier == "./missing.wat"
        ));
    }

    #[test]
    fn test_parse_error_carries_location() {
        let resolver = MemResolver::new().with_module("bad.wat", "(module\n  (func (oops)))");
        let err = load_graph(&Engine::default(), &resolver, "bad.wat")
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::Parse { ref specifier, .. } if specifier == "bad.wat"));
        assert!(matches!(
            err.location(),
            Some(SourceLocation::LineCol { line: 2, .. })
        ));
    }

    #[test]
    fn test_missing_named_export_rejected() {
        let resolver = MemResolver::new()
            .with_module(
                "main.wat",
                r#"(module (import "./lib.wat" "nope" (func)) (memory (export "memory") 1))"#,
            )
            .with_module("lib.wat", LEAF);
        let err = load_graph(&Engine::default(), &resolver, "main.wat")
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::ValidationError(_)));
    }

    #[test]
    fn test_capability_names_collected() {
        let resolver = MemResolver::new().with_module(
            "main.wat",
            r#"(module
                (import "global" "sqlSelect" (func (param i32) (result i32)))
                (import "global" "default_func" (func (param i32) (result i32)))
                (memory (export "memory") 1))"#,
        );
        let graph = load_graph(&Engine::default(), &resolver, "main.wat").unwrap();
        assert_eq!(graph.capability_names(), vec!["sqlSelect", "default_func"]);
    }
}
