//! Runtime configuration.
//!
//! Every section has a `Default` and a `from_env()` that applies `FNHOST_*`
//! overrides on top of it. Unparsable values are logged and ignored.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::loader::NamespacePolicy;

/// Loader and artifact settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Where shadow copies of native artifacts are placed.
    pub scratch_dir: PathBuf,

    /// Extra platform-reserved namespace prefixes.
    pub platform_namespaces: Vec<String>,

    /// Extra shared marshaling namespace prefixes.
    pub shared_namespaces: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("fnhost-shadow"),
            platform_namespaces: Vec::new(),
            shared_namespaces: Vec::new(),
        }
    }
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env_string("FNHOST_SCRATCH_DIR") {
            config.scratch_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_platform_namespace(mut self, prefix: impl Into<String>) -> Self {
        self.platform_namespaces.push(prefix.into());
        self
    }

    pub fn with_shared_namespace(mut self, prefix: impl Into<String>) -> Self {
        self.shared_namespaces.push(prefix.into());
        self
    }

    /// Namespace policy with the configured extra prefixes.
    pub fn namespace_policy(&self) -> NamespacePolicy {
        let policy = self
            .platform_namespaces
            .iter()
            .fold(NamespacePolicy::default(), |p, ns| {
                p.with_platform_namespace(ns.clone())
            });
        self.shared_namespaces
            .iter()
            .fold(policy, |p, ns| p.with_shared_namespace(ns.clone()))
    }
}

/// Loader pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Reuse loaders across invocations. When off, every invocation builds a
    /// one-off loader.
    pub enabled: bool,

    /// Entries unused for longer than this are evicted.
    pub idle_timeout: Duration,

    /// Period of the background sweep.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(enabled) = env_parse::<bool>("FNHOST_POOLING") {
            config.enabled = enabled;
        }
        if let Some(secs) = env_parse::<u64>("FNHOST_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("FNHOST_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        config
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Invocations allowed to run at once; further callers queue.
    pub max_concurrency: usize,

    /// Budget for contexts built by [`FunctionRuntime::context`](crate::FunctionRuntime::context).
    pub default_timeout: Duration,

    /// How long `shutdown` waits for in-flight invocations.
    pub shutdown_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 64,
            default_timeout: Duration::from_millis(30_000),
            shutdown_grace: Duration::from_millis(5_000),
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        match env_parse::<usize>("FNHOST_MAX_CONCURRENCY") {
            Some(0) => tracing::warn!("Ignoring FNHOST_MAX_CONCURRENCY=0"),
            Some(n) => config.max_concurrency = n,
            None => {}
        }
        if let Some(ms) = env_parse::<u64>("FNHOST_DEFAULT_TIMEOUT_MS") {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("FNHOST_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub loader: LoaderConfig,
    pub pool: PoolConfig,
    pub executor: ExecutorConfig,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            loader: LoaderConfig::from_env(),
            pool: PoolConfig::from_env(),
            executor: ExecutorConfig::from_env(),
        }
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}
