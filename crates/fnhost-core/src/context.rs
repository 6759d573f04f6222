//! Execution context, cooperative cancellation and the function contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fnhost_guest::GuestError;
pub use fnhost_guest::{Input, Value};

/// Handle for cooperative cancellation of an invocation.
///
/// Clones share one flag; any clone can trigger the abort and every other
/// clone sees it.
///
/// # Example
///
/// ```
/// use fnhost_core::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let handle_clone = handle.clone();
///
/// assert!(!handle.is_aborted());
/// handle_clone.abort();
/// assert!(handle.is_aborted());
/// ```
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Create a new abort handle.
    pub fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if abort has been requested.
    ///
    /// Functions should call this periodically during long-running work and
    /// return early if it is `true`.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Request abort of execution.
    ///
    /// This is a cooperative mechanism: code that never checks keeps running.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// Raw flag, passed across the artifact ABI.
    pub(crate) fn flag(&self) -> &AtomicBool {
        &self.aborted
    }
}

/// Per-invocation context, created by the caller.
///
/// The request id and budget are fixed at construction. The context also
/// carries the invocation's abort flag, which the executor raises when the
/// budget elapses.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    request_id: String,
    timeout: Duration,
    abort: AbortHandle,
}

impl ExecutionContext {
    /// Create a context with a fresh random request id.
    pub fn new(timeout: Duration) -> Self {
        Self::with_request_id(uuid::Uuid::new_v4().to_string(), timeout)
    }

    /// Create a context with a caller-chosen request id.
    pub fn with_request_id(request_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            request_id: request_id.into(),
            timeout,
            abort: AbortHandle::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wall-clock budget for the invocation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the invocation has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.abort.is_aborted()
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }
}

/// Error raised by a function's `handle`.
///
/// `kind` is the function's own classification and is reported verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<GuestError> for HandlerError {
    fn from(e: GuestError) -> Self {
        Self {
            kind: e.kind,
            message: e.message,
        }
    }
}

/// The function contract: what every entry-point instance provides.
///
/// Instances are built fresh for each invocation and dropped afterwards.
pub trait FunctionHandler: Send {
    fn handle(&mut self, input: Input, ctx: &ExecutionContext) -> Result<Value, HandlerError>;
}

/// Adapter turning a closure into a [`FunctionHandler`].
pub struct HandlerFn<F>(F);

impl<F> FunctionHandler for HandlerFn<F>
where
    F: FnMut(Input, &ExecutionContext) -> Result<Value, HandlerError> + Send,
{
    fn handle(&mut self, input: Input, ctx: &ExecutionContext) -> Result<Value, HandlerError> {
        (self.0)(input, ctx)
    }
}

/// Wrap a closure as a function handler.
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: FnMut(Input, &ExecutionContext) -> Result<Value, HandlerError> + Send,
{
    HandlerFn(f)
}
