//! Guest ABI names shared by the sandbox and guest authors.
//!
//! Guests import runtime intrinsics from [`SANDBOX_MODULE`] and host
//! capabilities from [`GLOBAL_MODULE`]. Any other import module name is a
//! specifier naming another guest module.

/// Import namespace of the runtime intrinsics.
pub const SANDBOX_MODULE: &str = "sandbox";

/// Import namespace of host capabilities.
pub const GLOBAL_MODULE: &str = "global";

/// Every guest module must export its linear memory under this name.
pub const MEMORY_EXPORT: &str = "memory";

/// Handle permanently bound to `undefined`.
pub const UNDEFINED_HANDLE: i32 = 0;

pub const PRINT: &str = "print";
pub const LOG: &str = "log";
pub const ERROR: &str = "error";
pub const STRING: &str = "string";
pub const NUMBER: &str = "number";
pub const TO_NUMBER: &str = "to_number";
pub const CONCAT: &str = "concat";
pub const LIST: &str = "list";
pub const PUSH: &str = "push";
pub const ITEM: &str = "item";
pub const GLOBAL_GET: &str = "global_get";
pub const GLOBAL_SET: &str = "global_set";
pub const THROW: &str = "throw";
pub const PROMISE_NEW: &str = "promise_new";
pub const PROMISE_RESOLVE: &str = "promise_resolve";
pub const PROMISE_REJECT: &str = "promise_reject";
pub const PROMISE_FULFILL: &str = "promise_fulfill";
pub const PROMISE_FAIL: &str = "promise_fail";
pub const PROMISE_ALL: &str = "promise_all";
pub const THEN: &str = "then";
pub const CATCH: &str = "catch";

/// Whether an import module name refers to another guest module.
pub fn is_guest_specifier(module: &str) -> bool {
    module != SANDBOX_MODULE && module != GLOBAL_MODULE
}
