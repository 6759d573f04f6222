//! Guest-side contract for fnhost function artifacts.
//!
//! A function artifact is a `cdylib` that links this crate and invokes
//! [`export_functions!`] once. The host (`fnhost-core`) reads the exported
//! manifest, resolves entry types by name and drives instances through the C
//! ABI declared in [`abi`].
//!
//! This crate is the one namespace both sides of the isolation boundary agree
//! on, so it stays small: serde types for the wire, the ABI function
//! signatures, and the guest trait.
//!
//! # Example
//!
//! ```ignore
//! use fnhost_guest::{GuestContext, GuestError, GuestFunction, Input, Value};
//!
//! #[derive(Default)]
//! struct Hello;
//!
//! impl GuestFunction for Hello {
//!     fn handle(&mut self, input: Input, _ctx: &GuestContext<'_>) -> Result<Value, GuestError> {
//!         let name = input.get("name").and_then(Value::as_str).unwrap_or("stranger");
//!         Ok(Value::from(format!("Hello, {name}")))
//!     }
//! }
//!
//! fnhost_guest::export_functions! {
//!     "hello.Hello" => Hello,
//! }
//! ```

pub mod abi;
mod export;

#[doc(hidden)]
pub mod __private {
    pub use crate::export::*;
}

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

pub use serde_json::{Map, Value};

/// Input payload handed to a function: a string-keyed JSON object.
pub type Input = Map<String, Value>;

/// Version of the C ABI described in [`abi`].
///
/// The host refuses artifacts that report a different value.
pub const ABI_VERSION: u32 = 1;

/// Fully qualified name of the function contract every entry type implements.
pub const FUNCTION_CONTRACT: &str = "fnhost.contract.FunctionContract";

/// Fully qualified name of the execution context contract type.
pub const EXECUTION_CONTEXT: &str = "fnhost.contract.ExecutionContext";

/// Fully qualified name of the handler error contract type.
pub const HANDLER_ERROR: &str = "fnhost.contract.HandlerError";

/// Namespace prefix reserved for contract types.
pub const CONTRACT_NAMESPACE: &str = "fnhost.contract.";

/// Manifest an artifact publishes through `fnhost_manifest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// ABI version the artifact was built against.
    pub abi_version: u32,
    /// Types the artifact defines, in constructor index order.
    pub types: Vec<ManifestType>,
}

/// One type declared by an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestType {
    /// Fully qualified type name, e.g. `hello.Hello`.
    pub name: String,
    /// Index passed to `fnhost_new`.
    pub index: u32,
    /// Names of the contracts the type implements.
    pub interfaces: Vec<String>,
}

/// Execution context as it crosses the ABI (JSON encoded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireContext {
    pub request_id: String,
    pub timeout_ms: u64,
}

/// Error a guest function raises.
///
/// `kind` is the guest's own classification (e.g. `"validation"`); the host
/// reports it verbatim in the execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestError {
    pub kind: String,
    pub message: String,
}

impl GuestError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for GuestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for GuestError {}

/// Context visible to guest code during one invocation.
pub struct GuestContext<'a> {
    request_id: String,
    timeout_ms: u64,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> GuestContext<'a> {
    pub fn new(wire: WireContext, cancel: Option<&'a AtomicBool>) -> Self {
        Self {
            request_id: wire.request_id,
            timeout_ms: wire.timeout_ms,
            cancel,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Budget the caller granted this invocation, in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Whether the host has asked this invocation to stop.
    ///
    /// Long-running functions should poll this and return early. The host
    /// cannot stop code that never looks.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Trait implemented by every exported function type.
///
/// A fresh instance is built with `Default` for every invocation.
pub trait GuestFunction: Send {
    fn handle(&mut self, input: Input, ctx: &GuestContext<'_>) -> Result<Value, GuestError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_context_cancellation() {
        let flag = AtomicBool::new(false);
        let ctx = GuestContext::new(
            WireContext {
                request_id: "req-1".to_string(),
                timeout_ms: 250,
            },
            Some(&flag),
        );
        assert_eq!(ctx.request_id(), "req-1");
        assert_eq!(ctx.timeout_ms(), 250);
        assert!(!ctx.is_cancelled());

        flag.store(true, Ordering::Relaxed);
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_context_without_flag_is_never_cancelled() {
        let ctx = GuestContext::new(
            WireContext {
                request_id: "req-2".to_string(),
                timeout_ms: 0,
            },
            None,
        );
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_guest_error_display() {
        let err = GuestError::new("validation", "name is required");
        assert_eq!(err.to_string(), "validation: name is required");
    }
}
