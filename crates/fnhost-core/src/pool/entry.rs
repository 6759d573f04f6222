//! Pooled entries and leases.
//!
//! An entry is *retired* when the pool stops handing it out (replaced, evicted,
//! refreshed or shut down). Its loader is closed once it is retired and no
//! lease is outstanding, whichever happens last.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::loader::{ArtifactVersion, IsolatedLoader};

#[derive(Debug, Default)]
struct LeaseState {
    active: usize,
    retired: bool,
}

#[derive(Debug)]
struct Usage {
    last_used: Instant,
    last_used_at: SystemTime,
}

/// A cached loader plus the artifact version it was built from.
#[derive(Debug)]
pub struct PooledLoaderEntry {
    loader: Arc<IsolatedLoader>,
    function_id: String,
    artifact_path: PathBuf,
    version: ArtifactVersion,
    usage: Mutex<Usage>,
    use_count: AtomicU64,
    leases: Mutex<LeaseState>,
}

impl PooledLoaderEntry {
    pub(crate) fn new(
        loader: IsolatedLoader,
        function_id: impl Into<String>,
        artifact_path: impl Into<PathBuf>,
        version: ArtifactVersion,
    ) -> Self {
        Self {
            loader: Arc::new(loader),
            function_id: function_id.into(),
            artifact_path: artifact_path.into(),
            version,
            usage: Mutex::new(Usage {
                last_used: Instant::now(),
                last_used_at: SystemTime::now(),
            }),
            use_count: AtomicU64::new(0),
            leases: Mutex::new(LeaseState::default()),
        }
    }

    pub fn loader(&self) -> &Arc<IsolatedLoader> {
        &self.loader
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn version(&self) -> ArtifactVersion {
        self.version
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    pub fn idle_time(&self) -> Duration {
        self.usage.lock().last_used.elapsed()
    }

    /// Wall-clock time of the last acquisition, in Unix milliseconds.
    pub fn last_used_at_millis(&self) -> u64 {
        self.usage
            .lock()
            .last_used_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn active_leases(&self) -> usize {
        self.leases.lock().active
    }

    pub fn is_retired(&self) -> bool {
        self.leases.lock().retired
    }

    pub(crate) fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        self.active_leases() == 0 && self.idle_time() > idle_timeout
    }

    /// Hand out a lease and record the use. Called under the key's lock.
    pub(crate) fn acquire(self: &Arc<Self>) -> LoaderLease {
        {
            let mut usage = self.usage.lock();
            usage.last_used = Instant::now();
            usage.last_used_at = SystemTime::now();
        }
        self.use_count.fetch_add(1, Ordering::Relaxed);
        self.leases.lock().active += 1;
        LoaderLease {
            entry: Arc::clone(self),
        }
    }

    /// Stop handing this entry out; close now or when the last lease returns.
    pub(crate) fn retire(&self) {
        let close_now = {
            let mut leases = self.leases.lock();
            if leases.retired {
                return;
            }
            leases.retired = true;
            leases.active == 0
        };
        if close_now {
            self.loader.close();
        } else {
            tracing::debug!(
                "Deferring close of {} for {} until leases return",
                self.loader.id(),
                self.function_id
            );
        }
    }

    fn release(&self) {
        let close_now = {
            let mut leases = self.leases.lock();
            leases.active = leases.active.saturating_sub(1);
            leases.retired && leases.active == 0
        };
        if close_now {
            self.loader.close();
        }
    }
}

/// Borrowed use of a pooled loader.
///
/// Dereferences to the [`IsolatedLoader`]. While any lease is alive the
/// loader is never closed, even if the pool has already replaced it.
#[derive(Debug)]
pub struct LoaderLease {
    entry: Arc<PooledLoaderEntry>,
}

impl LoaderLease {
    pub fn loader(&self) -> &Arc<IsolatedLoader> {
        self.entry.loader()
    }

    pub fn entry(&self) -> &PooledLoaderEntry {
        &self.entry
    }
}

impl Deref for LoaderLease {
    type Target = IsolatedLoader;

    fn deref(&self) -> &Self::Target {
        self.entry.loader()
    }
}

impl Drop for LoaderLease {
    fn drop(&mut self) {
        self.entry.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{HostContext, ModuleImage};

    fn entry() -> Arc<PooledLoaderEntry> {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fn.pkg");
        std::fs::write(&path, b"").unwrap();
        let version = ArtifactVersion::read(&path).unwrap();
        let loader =
            IsolatedLoader::from_image(&path, ModuleImage::new(), Arc::new(HostContext::new()));
        Arc::new(PooledLoaderEntry::new(loader, "fn", &path, version))
    }

    #[test]
    fn test_retire_without_leases_closes_immediately() {
        let entry = entry();
        entry.retire();
        assert!(entry.is_retired());
        assert!(entry.loader().is_closed());
    }

    #[test]
    fn test_retire_waits_for_last_lease() {
        let entry = entry();
        let first = entry.acquire();
        let second = entry.acquire();
        assert_eq!(entry.use_count(), 2);
        assert_eq!(entry.active_leases(), 2);

        entry.retire();
        assert!(!first.is_closed());

        drop(first);
        assert!(!entry.loader().is_closed());

        drop(second);
        assert_eq!(entry.active_leases(), 0);
        assert!(entry.loader().is_closed());
    }

    #[test]
    fn test_leased_entry_is_never_idle_expired() {
        let entry = entry();
        let lease = entry.acquire();
        assert!(!entry.is_idle_expired(Duration::ZERO));
        drop(lease);
        std::thread::sleep(Duration::from_millis(5));
        assert!(entry.is_idle_expired(Duration::ZERO));
    }
}
