//! Invocation of function entry points.
//!
//! # Module Structure
//!
//! - `executor` - worker dispatch, timeouts and shutdown
//! - `result` - the structured outcome of one invocation

mod executor;
mod result;

pub use executor::{FunctionExecutor, LoaderSource};
pub use result::{ExecutionFailure, ExecutionResult, FailureClass, Status};
