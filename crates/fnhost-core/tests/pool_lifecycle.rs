//! Integration tests for the loader pool.
//!
//! Artifacts are plain files served by a `RegistryOpener`; their mtimes are
//! moved explicitly to simulate deployments.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use fnhost_core::{
    HostContext, LoaderPool, ModuleImage, PoolConfig, RegistryOpener, TypeDef, Value, handler_fn,
};
use tempfile::TempDir;

struct Deployment {
    _dir: TempDir,
    hello: PathBuf,
    other: PathBuf,
    opener: Arc<RegistryOpener>,
}

fn image() -> ModuleImage {
    ModuleImage::new().with_type(TypeDef::function("hello.Hello", || {
        handler_fn(|_input, _ctx| Ok(Value::from("hi")))
    }))
}

fn deploy() -> Deployment {
    let dir = TempDir::new().unwrap();
    let hello = dir.path().join("hello-1.pkg");
    let other = dir.path().join("other-1.pkg");
    for path in [&hello, &other] {
        fs::write(path, b"artifact").unwrap();
        set_mtime(path, 1_000);
    }
    let opener = Arc::new(
        RegistryOpener::new()
            .with_module(&hello, image())
            .with_module(&other, image()),
    );
    Deployment {
        _dir: dir,
        hello,
        other,
        opener,
    }
}

fn set_mtime(path: &Path, secs: u64) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn pool(deployment: &Deployment, config: PoolConfig) -> LoaderPool {
    LoaderPool::new(
        deployment.opener.clone(),
        Arc::new(HostContext::new()),
        config,
    )
}

#[test]
fn test_unchanged_artifact_reuses_loader() {
    let deployment = deploy();
    let pool = pool(&deployment, PoolConfig::default());

    let first = pool.get("hello", &deployment.hello).unwrap();
    let second = pool.get("hello", &deployment.hello).unwrap();

    assert!(Arc::ptr_eq(first.loader(), second.loader()));
    assert_eq!(second.entry().use_count(), 2);
    assert_eq!(deployment.opener.opens(), 1);

    let stats = pool.stats();
    assert_eq!(stats.total_loaders, 1);
    assert_eq!(stats.total_use_count, 2);
    assert_eq!(stats.per_entry[0].active_leases, 2);
}

#[test]
fn test_modified_artifact_yields_new_loader_and_closes_old() {
    let deployment = deploy();
    let pool = pool(&deployment, PoolConfig::default());

    let old = pool.get("hello", &deployment.hello).unwrap().loader().clone();
    set_mtime(&deployment.hello, 2_000);
    let new = pool.get("hello", &deployment.hello).unwrap().loader().clone();

    assert_ne!(old.id(), new.id());
    assert!(old.is_closed());
    assert!(!new.is_closed());

    let stats = pool.stats();
    assert_eq!(stats.total_loaders, 1);
    assert_eq!(stats.per_entry[0].version.as_millis(), 2_000_000);
    assert_eq!(stats.per_entry[0].use_count, 1);
}

#[test]
fn test_lease_keeps_replaced_loader_open() {
    let deployment = deploy();
    let pool = pool(&deployment, PoolConfig::default());

    let in_flight = pool.get("hello", &deployment.hello).unwrap();
    set_mtime(&deployment.hello, 2_000);
    let replacement = pool.get("hello", &deployment.hello).unwrap();

    assert_ne!(in_flight.id(), replacement.id());
    // Still usable mid-invocation even though the pool moved on.
    assert!(!in_flight.is_closed());
    assert!(in_flight.resolve("hello.Hello").is_ok());

    let old = in_flight.loader().clone();
    drop(in_flight);
    assert!(old.is_closed());
}

#[test]
fn test_idle_sweep_evicts_only_idle_entries() {
    let deployment = deploy();
    let pool = pool(
        &deployment,
        PoolConfig::default().with_idle_timeout(Duration::from_millis(100)),
    );

    let idle = pool.get("other", &deployment.other).unwrap().loader().clone();
    thread::sleep(Duration::from_millis(200));
    let recent = pool.get("hello", &deployment.hello).unwrap().loader().clone();

    let report = pool.sweep_now();
    assert_eq!(report.evicted_idle, 1);
    assert_eq!(report.evicted_stale, 0);
    assert_eq!(report.remaining, 1);

    assert!(idle.is_closed());
    assert!(!recent.is_closed());
    let stats = pool.stats();
    assert_eq!(stats.per_entry.len(), 1);
    assert_eq!(stats.per_entry[0].function_id, "hello");
}

#[test]
fn test_leased_entry_survives_idle_sweep() {
    let deployment = deploy();
    let pool = pool(
        &deployment,
        PoolConfig::default().with_idle_timeout(Duration::from_millis(10)),
    );

    let lease = pool.get("hello", &deployment.hello).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(pool.sweep_now().evicted(), 0);
    assert!(!lease.is_closed());
}

#[test]
fn test_idle_entry_is_rebuilt_on_get() {
    let deployment = deploy();
    let pool = pool(
        &deployment,
        PoolConfig::default().with_idle_timeout(Duration::from_millis(20)),
    );

    let first = pool.get("hello", &deployment.hello).unwrap().loader().clone();
    thread::sleep(Duration::from_millis(60));
    let second = pool.get("hello", &deployment.hello).unwrap().loader().clone();

    assert_ne!(first.id(), second.id());
    assert!(first.is_closed());
}

#[test]
fn test_refresh_forces_rebuild() {
    let deployment = deploy();
    let pool = pool(&deployment, PoolConfig::default());

    let first = pool.get("hello", &deployment.hello).unwrap().loader().clone();
    assert!(pool.refresh("hello", &deployment.hello));
    assert!(first.is_closed());
    assert!(pool.is_empty());

    let second = pool.get("hello", &deployment.hello).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(deployment.opener.opens(), 2);
}

#[test]
fn test_stats_have_no_side_effects() {
    let deployment = deploy();
    let pool = pool(&deployment, PoolConfig::default());
    drop(pool.get("hello", &deployment.hello).unwrap());

    let before = pool.stats();
    let after = pool.stats();
    assert_eq!(before.total_use_count, after.total_use_count);
    assert_eq!(before.per_entry[0].last_used_at, after.per_entry[0].last_used_at);
    assert_eq!(after.per_entry[0].active_leases, 0);

    let json = serde_json::to_value(&after).unwrap();
    assert_eq!(json["total_loaders"], 1);
    assert_eq!(json["per_entry"][0]["function_id"], "hello");
}

#[tokio::test]
async fn test_background_sweep_evicts_stale_entry() {
    let deployment = deploy();
    let pool = pool(
        &deployment,
        PoolConfig::default().with_sweep_interval(Duration::from_millis(20)),
    );
    pool.start_sweeper().unwrap();

    let loader = pool.get("hello", &deployment.hello).unwrap().loader().clone();
    set_mtime(&deployment.hello, 3_000);

    // No further get: the sweep alone must notice the new version.
    let mut waited = Duration::ZERO;
    while !loader.is_closed() && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert!(loader.is_closed());
    assert!(pool.is_empty());

    pool.shutdown();
}
