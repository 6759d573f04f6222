//! Loader pool: cached loaders keyed by function and artifact path.
//!
//! Each key owns a slot with its own lock, so replacement and eviction of one
//! key are serialized while distinct keys proceed in parallel. Callers hold
//! [`LoaderLease`]s; a retired entry's loader is closed only after its last
//! lease is returned.
//!
//! # Module Structure
//!
//! - `entry` - pooled entries and leases
//! - `sweep` - background eviction task

mod entry;
mod sweep;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

pub use entry::{LoaderLease, PooledLoaderEntry};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::loader::{ArtifactOpener, ArtifactVersion, HostContext, IsolatedLoader};
use sweep::Sweeper;

/// Cache key: logical function identity plus artifact path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub function_id: String,
    pub artifact_path: PathBuf,
}

impl PoolKey {
    pub fn new(function_id: impl Into<String>, artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            function_id: function_id.into(),
            artifact_path: artifact_path.into(),
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    current: Option<Arc<PooledLoaderEntry>>,
    /// Set once the slot has been removed from the map; holders must retry.
    detached: bool,
}

#[derive(Debug, Default)]
struct KeySlot {
    state: Mutex<SlotState>,
}

/// Why the sweep removed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    Idle,
    Stale,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evicted_idle: usize,
    pub evicted_stale: usize,
    pub remaining: usize,
}

impl SweepReport {
    pub fn evicted(&self) -> usize {
        self.evicted_idle + self.evicted_stale
    }
}

/// Snapshot of one cached entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryStats {
    pub function_id: String,
    pub artifact_path: PathBuf,
    pub use_count: u64,
    /// Unix milliseconds.
    pub last_used_at: u64,
    pub idle_ms: u64,
    pub version: ArtifactVersion,
    pub active_leases: usize,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total_loaders: usize,
    pub total_use_count: u64,
    pub per_entry: Vec<EntryStats>,
}

pub(crate) struct PoolInner {
    slots: DashMap<PoolKey, Arc<KeySlot>>,
    opener: Arc<dyn ArtifactOpener>,
    host: Arc<HostContext>,
    config: PoolConfig,
    shut_down: AtomicBool,
}

/// Cache of isolated loaders.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use std::sync::Arc;
/// use fnhost_core::{DylibOpener, HostContext, LoaderPool, PoolConfig};
///
/// let pool = LoaderPool::new(
///     Arc::new(DylibOpener::default()),
///     Arc::new(HostContext::new()),
///     PoolConfig::default(),
/// );
/// let lease = pool.get("hello", Path::new("/fn/libhello.so"))?;
/// let entry = lease.resolve("hello.Hello")?;
/// # Ok::<(), fnhost_core::Error>(())
/// ```
pub struct LoaderPool {
    inner: Arc<PoolInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl LoaderPool {
    pub fn new(
        opener: Arc<dyn ArtifactOpener>,
        host: Arc<HostContext>,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                slots: DashMap::new(),
                opener,
                host,
                config,
                shut_down: AtomicBool::new(false),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Start the background sweep on the current tokio runtime.
    ///
    /// Does nothing if a sweeper is already running.
    pub fn start_sweeper(&self) -> Result<()> {
        if self.inner.is_shut_down() {
            return Err(Error::ShutDown);
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Configuration(format!("pool sweeper needs a tokio runtime: {e}")))?;
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(Sweeper::spawn(
                &handle,
                Arc::downgrade(&self.inner),
                self.inner.config.sweep_interval,
            ));
        }
        Ok(())
    }

    /// Lease the loader for `(function_id, artifact_path)`.
    ///
    /// Builds a fresh loader when none is cached, when the artifact's version
    /// changed, or when the cached one sat idle past the threshold. The
    /// replaced entry is retired.
    pub fn get(&self, function_id: &str, artifact_path: &Path) -> Result<LoaderLease> {
        self.inner.get(function_id, artifact_path)
    }

    /// Retire the entry for a key so the next `get` rebuilds it.
    ///
    /// Returns whether an entry was cached.
    pub fn refresh(&self, function_id: &str, artifact_path: &Path) -> bool {
        let key = PoolKey::new(function_id, artifact_path);
        let Some(slot) = self.inner.slots.get(&key).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let retired = slot.state.lock().current.take();
        self.inner.detach_if_empty(&key);

        match retired {
            Some(entry) => {
                tracing::info!(
                    "Refreshed {} ({}), {} retired",
                    function_id,
                    artifact_path.display(),
                    entry.loader().id()
                );
                entry.retire();
                true
            }
            None => false,
        }
    }

    /// Run one eviction pass now.
    pub fn sweep_now(&self) -> SweepReport {
        self.inner.sweep()
    }

    /// Side-effect free snapshot.
    pub fn stats(&self) -> PoolStats {
        let mut per_entry: Vec<EntryStats> = self
            .inner
            .slot_snapshot()
            .into_iter()
            .filter_map(|(_, slot)| slot.state.lock().current.clone())
            .map(|entry| EntryStats {
                function_id: entry.function_id().to_string(),
                artifact_path: entry.artifact_path().to_path_buf(),
                use_count: entry.use_count(),
                last_used_at: entry.last_used_at_millis(),
                idle_ms: entry.idle_time().as_millis() as u64,
                version: entry.version(),
                active_leases: entry.active_leases(),
            })
            .collect();
        per_entry.sort_by(|a, b| {
            (&a.function_id, &a.artifact_path).cmp(&(&b.function_id, &b.artifact_path))
        });

        PoolStats {
            total_loaders: per_entry.len(),
            total_use_count: per_entry.iter().map(|e| e.use_count).sum(),
            per_entry,
        }
    }

    /// Number of cached loaders.
    pub fn len(&self) -> usize {
        self.stats().total_loaders
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Stop the sweep and retire every entry. Later `get`s fail with
    /// [`Error::ShutDown`]. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }

        let mut retired = Vec::new();
        for (_, slot) in self.inner.slot_snapshot() {
            let mut state = slot.state.lock();
            state.detached = true;
            retired.extend(state.current.take());
        }
        self.inner.slots.clear();

        let count = retired.len();
        for entry in retired {
            entry.retire();
        }
        tracing::info!("Loader pool shut down, {} loaders retired", count);
    }
}

impl Drop for LoaderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn slot_snapshot(&self) -> Vec<(PoolKey, Arc<KeySlot>)> {
        self.slots
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect()
    }

    fn get(&self, function_id: &str, artifact_path: &Path) -> Result<LoaderLease> {
        let key = PoolKey::new(function_id, artifact_path);

        loop {
            if self.is_shut_down() {
                return Err(Error::ShutDown);
            }
            let slot = Arc::clone(
                self.slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(KeySlot::default()))
                    .value(),
            );

            let mut state = slot.state.lock();
            if state.detached {
                continue;
            }
            if self.is_shut_down() {
                return Err(Error::ShutDown);
            }

            let (lease, retired) = self.acquire_locked(&mut state, &key);
            let empty = state.current.is_none();
            drop(state);

            if let Some(old) = retired {
                old.retire();
            }
            if empty {
                self.detach_if_empty(&key);
            }
            return lease;
        }
    }

    /// Reuse or replace the slot's entry. Returns the lease and any entry
    /// that must be retired once the slot lock is released.
    fn acquire_locked(
        &self,
        state: &mut SlotState,
        key: &PoolKey,
    ) -> (Result<LoaderLease>, Option<Arc<PooledLoaderEntry>>) {
        let version = match ArtifactVersion::read(&key.artifact_path) {
            Ok(version) => version,
            // The cached loader (if any) no longer has an artifact behind it.
            Err(e) => return (Err(e), state.current.take()),
        };

        if let Some(entry) = &state.current {
            if entry.version() == version && !entry.is_idle_expired(self.config.idle_timeout) {
                tracing::debug!("Pool hit for {} ({})", key.function_id, entry.loader().id());
                return (Ok(entry.acquire()), None);
            }
        }

        let retired = state.current.take();
        if let Some(old) = &retired {
            tracing::info!(
                "Replacing {} for {}: version {} -> {}",
                old.loader().id(),
                key.function_id,
                old.version().as_millis(),
                version.as_millis()
            );
        }

        let loader = match IsolatedLoader::open(
            key.artifact_path.clone(),
            self.opener.as_ref(),
            Arc::clone(&self.host),
        ) {
            Ok(loader) => loader,
            Err(e) => return (Err(e), retired),
        };
        tracing::info!(
            "Created {} for {} ({})",
            loader.id(),
            key.function_id,
            key.artifact_path.display()
        );

        let entry = Arc::new(PooledLoaderEntry::new(
            loader,
            key.function_id.clone(),
            key.artifact_path.clone(),
            version,
        ));
        let lease = entry.acquire();
        state.current = Some(entry);
        (Ok(lease), retired)
    }

    /// Remove the key's slot if it holds no entry and nobody is using it.
    fn detach_if_empty(&self, key: &PoolKey) {
        self.slots.remove_if(key, |_, slot| match slot.state.try_lock() {
            Some(mut state) if state.current.is_none() => {
                state.detached = true;
                true
            }
            _ => false,
        });
    }

    pub(crate) fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for (key, slot) in self.slot_snapshot() {
            let mut state = slot.state.lock();
            let eviction = state.current.as_ref().and_then(|entry| {
                if entry.is_idle_expired(self.config.idle_timeout) {
                    Some(Eviction::Idle)
                } else {
                    match ArtifactVersion::read(entry.artifact_path()) {
                        Ok(version) if version == entry.version() => None,
                        _ => Some(Eviction::Stale),
                    }
                }
            });
            let retired = if eviction.is_some() {
                state.current.take()
            } else {
                None
            };
            let empty = state.current.is_none();
            drop(state);

            if let (Some(entry), Some(reason)) = (retired, eviction) {
                tracing::debug!(
                    "Sweep evicting {} for {} ({:?})",
                    entry.loader().id(),
                    key.function_id,
                    reason
                );
                match reason {
                    Eviction::Idle => report.evicted_idle += 1,
                    Eviction::Stale => report.evicted_stale += 1,
                }
                entry.retire();
            }
            if empty {
                self.detach_if_empty(&key);
            } else {
                report.remaining += 1;
            }
        }

        report
    }
}
