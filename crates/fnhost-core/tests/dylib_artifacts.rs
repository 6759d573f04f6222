//! Integration tests against the native sample artifact.
//!
//! Build it first with `cargo build -p fnhost-hello`, then run with
//! `cargo test -p fnhost-core --test dylib_artifacts -- --ignored`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fnhost_core::{
    DylibOpener, ExecutionContext, FunctionRuntime, HostContext, Input, IsolatedLoader,
    LoaderConfig, RuntimeConfig, Status, TypeOrigin, Value,
};
use tempfile::TempDir;

fn sample_artifact() -> PathBuf {
    let file_name = format!(
        "{}fnhost_hello{}",
        std::env::consts::DLL_PREFIX,
        std::env::consts::DLL_SUFFIX
    );
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../target/debug")
        .join(file_name);
    if !path.exists() {
        panic!("Sample artifact not found: {:?} (run `cargo build -p fnhost-hello`)", path);
    }
    path
}

fn runtime(scratch: &TempDir) -> FunctionRuntime {
    let config = RuntimeConfig::default()
        .with_loader(LoaderConfig::default().with_scratch_dir(scratch.path()));
    FunctionRuntime::with_dylibs(config).unwrap()
}

#[test]
#[ignore = "Requires the fnhost-hello cdylib to be built"]
fn test_two_loaders_are_isolated() {
    let artifact = sample_artifact();
    let scratch = TempDir::new().unwrap();
    let opener = DylibOpener::new(scratch.path());
    let host = Arc::new(HostContext::new());

    let a = IsolatedLoader::open(&artifact, &opener, host.clone()).unwrap();
    let b = IsolatedLoader::open(&artifact, &opener, host.clone()).unwrap();
    assert_eq!(
        a.declared_types().unwrap(),
        vec!["hello.Explode", "hello.Hello", "hello.Sleepy"]
    );

    let ta = a.resolve("hello.Hello").unwrap();
    let tb = b.resolve("hello.Hello").unwrap();
    assert!(!ta.is_same(&tb));
    assert_eq!(ta.origin(), TypeOrigin::Artifact(a.id()));
    assert!(ta.implements(host.function_contract()));
    assert!(tb.implements(host.function_contract()));

    // One shadow copy per loaded library.
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 2);
    a.close();
    b.close();
    drop((ta, tb));
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
#[ignore = "Requires the fnhost-hello cdylib to be built"]
async fn test_native_hello_world() {
    let artifact = sample_artifact();
    let scratch = TempDir::new().unwrap();
    let runtime = runtime(&scratch);

    let mut input = Input::new();
    input.insert("name".to_string(), Value::from("World"));
    let result = runtime
        .execute(
            "hello",
            &artifact,
            "hello.Hello",
            input,
            ExecutionContext::new(Duration::from_millis(2_000)),
        )
        .await
        .unwrap();

    assert_eq!(result.status(), Status::Success);
    assert_eq!(result.result(), Some(&Value::from("Hello, World")));
    runtime.shutdown().await;
}

#[tokio::test]
#[ignore = "Requires the fnhost-hello cdylib to be built"]
async fn test_native_failures() {
    let artifact = sample_artifact();
    let scratch = TempDir::new().unwrap();
    let runtime = runtime(&scratch);
    let ctx = || ExecutionContext::new(Duration::from_millis(2_000));

    let missing_name = runtime
        .execute("hello", &artifact, "hello.Hello", Input::new(), ctx())
        .await
        .unwrap();
    assert_eq!(missing_name.error_kind(), Some("validation"));

    let panicked = runtime
        .execute("explode", &artifact, "hello.Explode", Input::new(), ctx())
        .await
        .unwrap();
    assert_eq!(panicked.status(), Status::Failure);
    assert_eq!(panicked.error_kind(), Some("panic"));
    assert!(panicked.error().unwrap().message.contains("boom"));

    runtime.shutdown().await;
}

#[tokio::test]
#[ignore = "Requires the fnhost-hello cdylib to be built"]
async fn test_native_timeout_cancels_guest() {
    let artifact = sample_artifact();
    let scratch = TempDir::new().unwrap();
    let runtime = runtime(&scratch);

    let mut input = Input::new();
    input.insert("millis".to_string(), Value::from(10_000u64));
    let started = Instant::now();
    let result = runtime
        .execute(
            "sleepy",
            &artifact,
            "hello.Sleepy",
            input,
            ExecutionContext::new(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    assert_eq!(result.status(), Status::Timeout);
    assert!(started.elapsed() < Duration::from_secs(1));

    // The guest sees the flag through the ABI and returns promptly.
    assert_eq!(runtime.shutdown().await, 0);
}
