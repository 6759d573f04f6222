//! Function executor.
//!
//! Runs each invocation on a blocking worker thread, bounded by a semaphore
//! and by the context's budget.
//!
//! # Timeouts
//!
//! The budget bounds the caller's wait, not the callee's lifetime. When the
//! deadline passes the caller gets a `Timeout` result at once and the
//! invocation's abort flag is raised; a handler that never checks it keeps
//! running, and keeps holding its permit, until it returns on its own.
//! Stopping it for real would need a killable process per invocation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::timeout_at;

use super::result::{ExecutionFailure, ExecutionResult, FailureClass};
use crate::config::ExecutorConfig;
use crate::context::{AbortHandle, ExecutionContext, Input, Value};
use crate::error::{Error, Result, panic_message};
use crate::loader::{ArtifactOpener, ArtifactVersion, HostContext, IsolatedLoader};
use crate::pool::LoaderPool;

/// Where the executor gets its loaders from.
#[derive(Clone)]
pub enum LoaderSource {
    /// Lease from a shared pool.
    Pooled(Arc<LoaderPool>),
    /// Build a private loader per invocation and close it afterwards.
    OneOff {
        opener: Arc<dyn ArtifactOpener>,
        host: Arc<HostContext>,
    },
}

struct InFlight {
    request_id: String,
    abort: AbortHandle,
}

struct ExecutorInner {
    source: LoaderSource,
    permits: Arc<Semaphore>,
    in_flight: DashMap<u64, InFlight>,
    next_ticket: AtomicU64,
    accepting: AtomicBool,
}

/// Removes an invocation from the in-flight registry when its worker ends.
struct InFlightGuard {
    inner: Arc<ExecutorInner>,
    ticket: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.ticket);
    }
}

/// Executes function entry points under a timeout.
pub struct FunctionExecutor {
    inner: Arc<ExecutorInner>,
    config: ExecutorConfig,
}

impl FunctionExecutor {
    pub fn new(source: LoaderSource, config: ExecutorConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            inner: Arc::new(ExecutorInner {
                source,
                permits: Arc::new(Semaphore::new(permits)),
                in_flight: DashMap::new(),
                next_ticket: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
            }),
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Invocations whose workers have not finished yet, including ones whose
    /// caller already received a timeout.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Run `entry_class` from the artifact at `artifact_path`.
    ///
    /// Every outcome is folded into the returned [`ExecutionResult`]. The
    /// only errors are [`Error::ArtifactNotFound`], checked before anything
    /// is scheduled, and [`Error::ShutDown`] once [`shutdown`](Self::shutdown)
    /// has begun. Any other failure to read the artifact is an
    /// `Infrastructure` failure result.
    pub async fn execute(
        &self,
        function_id: &str,
        artifact_path: &Path,
        entry_class: &str,
        input: Input,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        let started = Instant::now();
        let request_id = ctx.request_id().to_string();
        match ArtifactVersion::read(artifact_path) {
            Ok(_) => {}
            Err(e @ Error::ArtifactNotFound(_)) => return Err(e),
            Err(e) => {
                tracing::error!(
                    "Cannot read artifact {} for {}: {}",
                    artifact_path.display(),
                    function_id,
                    e
                );
                return Ok(ExecutionResult::failure(
                    request_id,
                    function_id,
                    ExecutionFailure::from_error(&e),
                    started.elapsed(),
                ));
            }
        }

        let budget = ctx.timeout();
        let deadline = deadline_after(budget);

        // Time spent queued counts against the budget.
        let permit = match timeout_at(deadline, Arc::clone(&self.inner.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Ok(ExecutionResult::failure(
                    request_id,
                    function_id,
                    ExecutionFailure::from_error(&Error::ShutDown),
                    started.elapsed(),
                ));
            }
            Err(_) => {
                ctx.abort_handle().abort();
                tracing::warn!(
                    "{} ({}) timed out after {:?} waiting for a worker",
                    function_id,
                    request_id,
                    budget
                );
                return Ok(ExecutionResult::timeout(
                    request_id,
                    function_id,
                    budget,
                    started.elapsed(),
                ));
            }
        };

        let guard = self.inner.track(&request_id, ctx.abort_handle().clone());
        let abort = ctx.abort_handle().clone();
        let inner = Arc::clone(&self.inner);
        let call = Call {
            function_id: function_id.to_string(),
            artifact_path: artifact_path.to_path_buf(),
            entry_class: entry_class.to_string(),
        };

        let worker = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _guard = guard;
            inner.run(&call, input, &ctx)
        });

        let result = match timeout_at(deadline, worker).await {
            Ok(Ok(Ok(value))) => {
                tracing::debug!("{} ({}) succeeded", function_id, request_id);
                ExecutionResult::success(request_id, function_id, value, started.elapsed())
            }
            Ok(Ok(Err(failure))) => {
                tracing::debug!(
                    "{} ({}) failed: {} {}",
                    function_id,
                    request_id,
                    failure.kind,
                    failure.message
                );
                ExecutionResult::failure(request_id, function_id, failure, started.elapsed())
            }
            Ok(Err(join_error)) => {
                tracing::error!("Worker for {} ({}) died: {}", function_id, request_id, join_error);
                ExecutionResult::failure(
                    request_id,
                    function_id,
                    ExecutionFailure::new(
                        FailureClass::Infrastructure,
                        "worker-failed",
                        join_error.to_string(),
                    ),
                    started.elapsed(),
                )
            }
            Err(_) => {
                abort.abort();
                tracing::warn!(
                    "{} ({}) exceeded its {:?} budget; cancellation requested",
                    function_id,
                    request_id,
                    budget
                );
                ExecutionResult::timeout(request_id, function_id, budget, started.elapsed())
            }
        };
        Ok(result)
    }

    /// Stop accepting work and drain.
    ///
    /// Waits up to `grace` for in-flight invocations, then raises the abort
    /// flag of every one still running. Returns how many were still running.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return self.in_flight();
        }
        self.inner.permits.close();

        let deadline = deadline_after(grace);
        while !self.inner.in_flight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stragglers: Vec<String> = self
            .inner
            .in_flight
            .iter()
            .map(|entry| {
                entry.abort.abort();
                entry.request_id.clone()
            })
            .collect();
        if stragglers.is_empty() {
            tracing::info!("Executor drained");
        } else {
            tracing::warn!(
                "Executor shut down with {} invocations still running: {}",
                stragglers.len(),
                stragglers.join(", ")
            );
        }
        stragglers.len()
    }

    pub fn is_shut_down(&self) -> bool {
        !self.inner.accepting.load(Ordering::SeqCst)
    }
}

/// `now + budget`, saturating at a far-future instant for unbounded budgets.
fn deadline_after(budget: Duration) -> tokio::time::Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    let now = tokio::time::Instant::now();
    now.checked_add(budget).unwrap_or_else(|| now + FAR_FUTURE)
}

struct Call {
    function_id: String,
    artifact_path: PathBuf,
    entry_class: String,
}

impl ExecutorInner {
    fn track(self: &Arc<Self>, request_id: &str, abort: AbortHandle) -> InFlightGuard {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(
            ticket,
            InFlight {
                request_id: request_id.to_string(),
                abort,
            },
        );
        InFlightGuard {
            inner: Arc::clone(self),
            ticket,
        }
    }

    /// Worker body. Any loader built here is released before returning.
    fn run(
        &self,
        call: &Call,
        input: Input,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, ExecutionFailure> {
        let fail = |e: Error| ExecutionFailure::from_error(&e);
        match &self.source {
            LoaderSource::Pooled(pool) => {
                let lease = pool.get(&call.function_id, &call.artifact_path).map_err(fail)?;
                invoke(&lease, &call.entry_class, input, ctx)
            }
            LoaderSource::OneOff { opener, host } => {
                let loader =
                    IsolatedLoader::open(&call.artifact_path, opener.as_ref(), Arc::clone(host))
                        .map_err(fail)?;
                let outcome = invoke(&loader, &call.entry_class, input, ctx);
                loader.close();
                outcome
            }
        }
    }
}

/// Resolve, check, construct and call the entry point.
fn invoke(
    loader: &IsolatedLoader,
    entry_class: &str,
    input: Input,
    ctx: &ExecutionContext,
) -> std::result::Result<Value, ExecutionFailure> {
    let fail = |e: Error| ExecutionFailure::from_error(&e);

    let entry = loader.resolve(entry_class).map_err(fail)?;
    let contract = loader.function_contract().map_err(fail)?;
    if !entry.implements(&contract) {
        return Err(fail(Error::ContractMismatch {
            name: entry.name().to_string(),
            contract: contract.name().to_string(),
        }));
    }

    if ctx.is_cancelled() {
        return Err(fail(Error::Aborted));
    }
    let mut instance = entry.instantiate().map_err(fail)?;
    if ctx.is_cancelled() {
        return Err(fail(Error::Aborted));
    }

    match catch_unwind(AssertUnwindSafe(|| instance.handle(input, ctx))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ExecutionFailure::from_handler(e)),
        Err(payload) => Err(ExecutionFailure::new(
            FailureClass::Invocation,
            "panic",
            panic_message(payload.as_ref()),
        )),
    }
}
