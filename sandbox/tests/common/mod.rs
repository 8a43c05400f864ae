//! Shared test helpers for integration tests.
//!
//! Provides a WAT guest builder that lays out string constants in a data
//! segment and imports every sandbox intrinsic, the sample capability
//! table, and sandbox factory functions used across all integration test
//! files.

#![allow(dead_code)]

use std::sync::Arc;

use keel_hostapi::{BufferSink, CapabilityTable, LogLevel, MemResolver, Value};
use keel_sandbox::{Sandbox, SandboxConfig};

/// Every intrinsic, imported under `$name`.
const PRELUDE: &str = r#"
    (import "sandbox" "print" (func $print (param i32 i32)))
    (import "sandbox" "log" (func $log (param i32)))
    (import "sandbox" "error" (func $error (param i32)))
    (import "sandbox" "string" (func $string (param i32 i32) (result i32)))
    (import "sandbox" "number" (func $number (param f64) (result i32)))
    (import "sandbox" "to_number" (func $to_number (param i32) (result f64)))
    (import "sandbox" "concat" (func $concat (param i32 i32) (result i32)))
    (import "sandbox" "list" (func $list (result i32)))
    (import "sandbox" "push" (func $push (param i32 i32)))
    (import "sandbox" "item" (func $item (param i32 i32) (result i32)))
    (import "sandbox" "global_get" (func $global_get (param i32 i32) (result i32)))
    (import "sandbox" "global_set" (func $global_set (param i32 i32 i32)))
    (import "sandbox" "throw" (func $throw (param i32)))
    (import "sandbox" "promise_new" (func $promise_new (result i32)))
    (import "sandbox" "promise_resolve" (func $promise_resolve (param i32) (result i32)))
    (import "sandbox" "promise_reject" (func $promise_reject (param i32) (result i32)))
    (import "sandbox" "promise_fulfill" (func $promise_fulfill (param i32 i32)))
    (import "sandbox" "promise_fail" (func $promise_fail (param i32 i32)))
    (import "sandbox" "promise_all" (func $promise_all (param i32) (result i32)))
    (import "sandbox" "then" (func $then (param i32 i32 i32 i32) (result i32)))
    (import "sandbox" "catch" (func $catch (param i32 i32 i32 i32) (result i32)))
"#;

// ── Guest builder ──

/// Builds a guest module in WebAssembly text.
#[derive(Default)]
pub struct Guest {
    imports: Vec<String>,
    data: Vec<(u32, String)>,
    offset: u32,
    items: Vec<String>,
    start: Option<String>,
}

impl Guest {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(i32.const ptr) (i32.const len)` of a string constant.
    pub fn s(&mut self, text: &str) -> String {
        if let Some((ptr, _)) = self.data.iter().find(|(_, t)| t == text) {
            return format!("(i32.const {}) (i32.const {})", ptr, text.len());
        }
        let ptr = self.offset;
        self.data.push((ptr, text.to_string()));
        self.offset += text.len() as u32;
        format!("(i32.const {}) (i32.const {})", ptr, text.len())
    }

    /// Expression producing a string value handle.
    pub fn string(&mut self, text: &str) -> String {
        format!("(call $string {})", self.s(text))
    }

    /// Statement logging a string constant.
    pub fn log(&mut self, text: &str) -> String {
        format!("(call $log {})", self.string(text))
    }

    /// Statement printing a string constant.
    pub fn print(&mut self, text: &str) -> String {
        format!("(call $print {})", self.s(text))
    }

    /// Expression reading a global.
    pub fn global_get(&mut self, name: &str) -> String {
        format!("(call $global_get {})", self.s(name))
    }

    /// Statement writing a global.
    pub fn global_set(&mut self, name: &str, value: &str) -> String {
        format!("(call $global_set {} {})", self.s(name), value)
    }

    /// Expression attaching a fulfilment continuation export.
    pub fn then(&mut self, promise: &str, export: &str) -> String {
        format!("(call $then {} {} (i32.const 0))", promise, self.s(export))
    }

    /// Expression attaching a rejection continuation export.
    pub fn catch(&mut self, promise: &str, export: &str) -> String {
        format!("(call $catch {} {} (i32.const 0))", promise, self.s(export))
    }

    /// Import `name` from another guest module as `$name`.
    pub fn import_func(&mut self, module: &str, name: &str) -> &mut Self {
        self.imports.push(format!(
            r#"(import "{}" "{}" (func ${}))"#,
            module, name, name
        ));
        self
    }

    /// Import a host capability as `$name`.
    pub fn capability(&mut self, name: &str) -> &mut Self {
        self.imports.push(format!(
            r#"(import "global" "{}" (func ${} (param i32) (result i32)))"#,
            name, name
        ));
        self
    }

    /// Add a module field (function, global, export...).
    pub fn item(&mut self, wat: &str) -> &mut Self {
        self.items.push(wat.to_string());
        self
    }

    /// Top-level code.
    pub fn start(&mut self, body: &str) -> &mut Self {
        self.start = Some(body.to_string());
        self
    }

    pub fn build(&self) -> String {
        let mut out = String::from("(module\n");
        out.push_str(PRELUDE);
        for import in &self.imports {
            out.push_str(&format!("    {}\n", import));
        }
        out.push_str("    (memory (export \"memory\") 1)\n");
        for (ptr, text) in &self.data {
            out.push_str(&format!(
                "    (data (i32.const {}) \"{}\")\n",
                ptr,
                escape(text)
            ));
        }
        for item in &self.items {
            out.push_str(&format!("    {}\n", item));
        }
        if let Some(body) = &self.start {
            out.push_str(&format!("    (func $__top {})\n    (start $__top)\n", body));
        }
        out.push_str(")\n");
        out
    }
}

fn escape(text: &str) -> String {
    text.chars()
        .flat_map(|c| match c {
            '"' => vec!['\\', '"'],
            '\\' => vec!['\\', '\\'],
            '\n' => vec!['\\', 'n'],
            c => vec![c],
        })
        .collect()
}

// ── Sample modules ──

/// Dependency module with two named functions.
pub fn lib_module() -> String {
    let mut g = Guest::new();
    let third = g.log("thirdFunc");
    let fourth = g.log("fourthFunc");
    g.item(&format!(r#"(func (export "thirdFunc") {})"#, third))
        .item(&format!(r#"(func (export "fourthFunc") {})"#, fourth));
    g.build()
}

/// Entry module modelled on the sample script: imports two functions,
/// defines a tripling helper, an async function that joins two resolved
/// promises, and exports `mainFunc`/`mainFunc2`/`triple`.
pub fn main_module() -> String {
    let mut g = Guest::new();
    g.import_func("./lib.wat", "thirdFunc")
        .import_func("./lib.wat", "fourthFunc")
        .capability("default_func")
        .capability("sqlSelect");

    // triple(args) -> 3 * args[0], logging "triple(<a>)"
    let open = g.string("triple(");
    let close = g.string(")");
    g.item(&format!(
        r#"(func $triple (export "triple") (param $args i32) (result i32) (local $a i32)
            (local.set $a (call $item (local.get $args) (i32.const 0)))
            (call $log (call $concat (call $concat {open} (local.get $a)) {close}))
            (call $number (f64.mul (f64.const 3) (call $to_number (local.get $a)))))"#,
    ));

    let in_main2 = g.log("In main_func2");
    g.item(&format!(r#"(func $mainFunc2 (export "mainFunc2") {})"#, in_main2));

    // joined(values) -> "<first> <second>"
    let space = g.string(" ");
    let joined_label = g.string("joined: ");
    g.item(&format!(
        r#"(func (export "joined") (param $v i32) (param $env i32) (result i32) (local $r i32)
            (local.set $r (call $concat
                (call $concat (call $item (local.get $v) (i32.const 0)) {space})
                (call $item (local.get $v) (i32.const 1))))
            (call $log (call $concat {joined_label} (local.get $r)))
            (local.get $r))"#,
    ));

    // second_func() -> Promise.all([resolve("hello"), resolve("world")]).then(joined)
    let hello4 = g.log("Hello, World 4 from JS!");
    let hello = g.string("hello");
    let world = g.string("world");
    let then_joined = g.then("(call $promise_all (local.get $ops))", "joined");
    g.item(&format!(
        r#"(func $second_func (result i32) (local $ops i32)
            {hello4}
            (call $thirdFunc)
            (local.set $ops (call $list))
            (call $push (local.get $ops) (call $promise_resolve {hello}))
            (call $push (local.get $ops) (call $promise_resolve {world}))
            {then_joined})"#,
    ));

    // storeStmt(value): globalThis.stmt = value
    let set_stmt = g.global_set("stmt", "(local.get $v)");
    g.item(&format!(
        r#"(func (export "storeStmt") (param $v i32) (param $env i32) (result i32)
            {set_stmt}
            (local.get $v))"#,
    ));

    // onError(reason): console.error(reason)
    g.item(
        r#"(func (export "onError") (param $e i32) (param $env i32) (result i32)
            (call $error (local.get $e))
            (i32.const 0))"#,
    );

    // async mainFunc()
    let hello2 = g.log("Hello, World 2 from JS!");
    let input_label = g.string("input from test ");
    let input = g.global_get("input");
    let then_store = g.then("(call $second_func)", "storeStmt");
    g.item(&format!(
        r#"(func $mainFunc (export "mainFunc") (result i32)
            {hello2}
            (call $log (call $concat {input_label} {input}))
            {then_store})"#,
    ));

    let banner = g.print("Hello in test.js!");
    let catch_main = g.catch("(call $mainFunc)", "onError");
    g.start(&format!(
        r#"
            {banner}
            (call $mainFunc2)
            (drop (call $mainFunc))
            (drop (call $default_func (i32.const 0)))
            (drop (call $sqlSelect (i32.const 0)))
            (drop {catch_main})"#,
    ));
    g.build()
}

/// Resolver holding the sample entry and its dependency.
pub fn sample_resolver() -> MemResolver {
    MemResolver::new()
        .with_module("main.wat", main_module())
        .with_module("lib.wat", lib_module())
}

/// Capability table the sample expects: an input value, a callback that
/// prints, and a query function.
pub fn sample_capabilities() -> CapabilityTable {
    CapabilityTable::new()
        .with_value("input", 42)
        .with_function("default_func", |ctx, _| {
            ctx.print("default_func called");
            Ok(Value::Undefined)
        })
        .with_function("sqlSelect", |ctx, _| {
            ctx.log(LogLevel::Info, "sqlSelect");
            Ok(Value::List(vec!["row1".into()]))
        })
}

// ── Sandbox factories ──

pub fn sandbox(resolver: MemResolver) -> Sandbox {
    Sandbox::new(resolver, SandboxConfig::default()).expect("sandbox")
}

pub fn sandbox_with(resolver: MemResolver, config: SandboxConfig) -> Sandbox {
    Sandbox::new(resolver, config).expect("sandbox")
}

/// Sandbox echoing guest output into a buffer.
pub fn echoing_sandbox(resolver: MemResolver) -> (Sandbox, Arc<BufferSink>) {
    let sink = Arc::new(BufferSink::new());
    let config = SandboxConfig {
        echo_guest_output: true,
        ..SandboxConfig::default()
    };
    let sandbox = sandbox_with(resolver, config).with_sink(sink.clone());
    (sandbox, sink)
}

/// Single-module resolver.
pub fn only(entry: &str, source: String) -> MemResolver {
    MemResolver::new().with_module(entry, source)
}
