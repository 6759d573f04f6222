//! Core runtime for fnhost: isolated, pooled execution of function artifacts.
//!
//! This crate provides:
//! - Isolated loaders with an explicit resolution chain
//! - A loader pool with staleness detection, idle eviction and leases
//! - A function executor with budgets, cooperative cancellation and
//!   structured results
//! - Native artifact loading via libloading

pub mod config;
pub mod context;
pub mod error;
pub mod execute;
pub mod loader;
pub mod pool;
pub mod runtime;

pub use config::{ExecutorConfig, LoaderConfig, PoolConfig, RuntimeConfig};
pub use context::{
    AbortHandle, ExecutionContext, FunctionHandler, HandlerError, HandlerFn, Input, Value,
    handler_fn,
};
pub use error::{Error, Result};
pub use execute::{
    ExecutionFailure, ExecutionResult, FailureClass, FunctionExecutor, LoaderSource, Status,
};
pub use loader::{
    ArtifactOpener, ArtifactVersion, DylibOpener, HostContext, HostContextBuilder, IsolatedLoader,
    LoaderId, ModuleImage, Namespace, NamespacePolicy, RegistryOpener, ResolutionSource, TypeDef,
    TypeOrigin, TypeRef,
};
pub use pool::{EntryStats, LoaderLease, LoaderPool, PoolKey, PoolStats, PooledLoaderEntry, SweepReport};
pub use runtime::FunctionRuntime;
