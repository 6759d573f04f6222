//! The assembled runtime: host context, pool and executor.

use std::path::Path;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::context::{ExecutionContext, Input};
use crate::error::Result;
use crate::execute::{ExecutionResult, FunctionExecutor, LoaderSource};
use crate::loader::{ArtifactOpener, DylibOpener, HostContext};
use crate::pool::{LoaderPool, PoolStats, SweepReport};

/// One function runtime, constructed once and shut down explicitly.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use fnhost_core::{FunctionRuntime, Input, RuntimeConfig};
///
/// # async fn demo() -> fnhost_core::Result<()> {
/// let runtime = FunctionRuntime::with_dylibs(RuntimeConfig::from_env())?;
/// let mut input = Input::new();
/// input.insert("name".into(), "World".into());
///
/// let result = runtime
///     .execute("hello", Path::new("/fn/libhello.so"), "hello.Hello", input, runtime.context())
///     .await?;
/// println!("{}", serde_json::to_string(&result).unwrap());
/// runtime.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct FunctionRuntime {
    config: RuntimeConfig,
    host: Arc<HostContext>,
    pool: Option<Arc<LoaderPool>>,
    executor: FunctionExecutor,
}

impl FunctionRuntime {
    /// Build a runtime around `opener`.
    ///
    /// When pooling is enabled and a tokio runtime is current, the pool's
    /// background sweep is started as well.
    pub fn new(config: RuntimeConfig, opener: Arc<dyn ArtifactOpener>) -> Result<Self> {
        let host = Arc::new(
            HostContext::builder()
                .policy(config.loader.namespace_policy())
                .build()?,
        );
        Self::with_host(config, opener, host)
    }

    /// Build a runtime that loads native artifacts.
    pub fn with_dylibs(config: RuntimeConfig) -> Result<Self> {
        let opener = Arc::new(DylibOpener::new(config.loader.scratch_dir.clone()));
        Self::new(config, opener)
    }

    /// Build a runtime around a prepared host context.
    pub fn with_host(
        config: RuntimeConfig,
        opener: Arc<dyn ArtifactOpener>,
        host: Arc<HostContext>,
    ) -> Result<Self> {
        let (pool, source) = if config.pool.enabled {
            let pool = Arc::new(LoaderPool::new(opener, Arc::clone(&host), config.pool.clone()));
            if tokio::runtime::Handle::try_current().is_ok() {
                pool.start_sweeper()?;
            } else {
                tracing::debug!("No tokio runtime; pool sweep runs only on demand");
            }
            (Some(Arc::clone(&pool)), LoaderSource::Pooled(pool))
        } else {
            let source = LoaderSource::OneOff {
                opener,
                host: Arc::clone(&host),
            };
            (None, source)
        };

        tracing::info!(
            "Function runtime ready (pooling: {}, max concurrency: {})",
            pool.is_some(),
            config.executor.max_concurrency
        );
        let executor = FunctionExecutor::new(source, config.executor.clone());
        Ok(Self {
            config,
            host,
            pool,
            executor,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    pub fn pool(&self) -> Option<&Arc<LoaderPool>> {
        self.pool.as_ref()
    }

    pub fn executor(&self) -> &FunctionExecutor {
        &self.executor
    }

    /// Fresh context with the configured default budget.
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(self.config.executor.default_timeout)
    }

    /// See [`FunctionExecutor::execute`].
    pub async fn execute(
        &self,
        function_id: &str,
        artifact_path: &Path,
        entry_class: &str,
        input: Input,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult> {
        self.executor
            .execute(function_id, artifact_path, entry_class, input, ctx)
            .await
    }

    /// Pool snapshot; empty when pooling is off.
    pub fn stats(&self) -> PoolStats {
        self.pool.as_ref().map(|p| p.stats()).unwrap_or_default()
    }

    /// Drop the cached loader for a key. No-op without a pool.
    pub fn refresh(&self, function_id: &str, artifact_path: &Path) -> bool {
        self.pool
            .as_ref()
            .is_some_and(|p| p.refresh(function_id, artifact_path))
    }

    pub fn sweep_now(&self) -> SweepReport {
        self.pool.as_ref().map(|p| p.sweep_now()).unwrap_or_default()
    }

    /// Drain the executor within the configured grace, then shut the pool.
    ///
    /// Returns how many invocations were still running.
    pub async fn shutdown(&self) -> usize {
        let stragglers = self.executor.shutdown(self.config.executor.shutdown_grace).await;
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
        stragglers
    }

    pub fn is_shut_down(&self) -> bool {
        self.executor.is_shut_down()
    }
}
