//! Structured invocation outcomes.

use std::time::Duration;

use serde::Serialize;

use crate::context::{HandlerError, Value};
use crate::error::Error;

/// Final state of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Failure,
    Timeout,
}

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    /// Artifact missing or unusable, contract not implemented.
    Configuration,
    /// Entry type absent from the artifact and the host.
    Resolution,
    /// No default constructor, or construction failed.
    Instantiation,
    /// The handler itself failed.
    Invocation,
    /// Budget exceeded.
    Timeout,
    /// Executor-internal failure.
    Infrastructure,
}

/// Why an invocation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionFailure {
    pub class: FailureClass,
    pub kind: String,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(class: FailureClass, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn from_error(error: &Error) -> Self {
        let (class, kind) = error.classify();
        Self::new(class, kind, error.to_string())
    }

    /// Handler failures keep the handler's own kind.
    pub fn from_handler(error: HandlerError) -> Self {
        Self::new(FailureClass::Invocation, error.kind, error.message)
    }
}

/// Outcome of one invocation. Built exactly once, never modified.
///
/// `result` is present iff the status is `Success`; `error` iff it is not.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    request_id: String,
    function_id: String,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ExecutionFailure>,
    duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(
        request_id: impl Into<String>,
        function_id: impl Into<String>,
        value: Value,
        duration: Duration,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            function_id: function_id.into(),
            status: Status::Success,
            result: Some(value),
            error: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        function_id: impl Into<String>,
        failure: ExecutionFailure,
        duration: Duration,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            function_id: function_id.into(),
            status: Status::Failure,
            result: None,
            error: Some(failure),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn timeout(
        request_id: impl Into<String>,
        function_id: impl Into<String>,
        budget: Duration,
        duration: Duration,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            function_id: function_id.into(),
            status: Status::Timeout,
            result: None,
            error: Some(ExecutionFailure::new(
                FailureClass::Timeout,
                "timeout",
                format!("execution exceeded budget of {} ms", budget.as_millis()),
            )),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ExecutionFailure> {
        self.error.as_ref()
    }

    /// Kind of the failure, if any.
    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
}
