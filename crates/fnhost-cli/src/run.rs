//! Run command implementation for the fnhost CLI.
//!
//! Prints one JSON `ExecutionResult` per line on stdout, then the pool
//! statistics if requested.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use fnhost_core::{ExecutionContext, FunctionRuntime, Input, RuntimeConfig, Status, Value};

pub struct RunOptions {
    pub function_id: String,
    pub entry: String,
    pub input: String,
    pub timeout_ms: Option<u64>,
    pub repeat: u32,
    pub pooling: bool,
    pub stats: bool,
}

/// Execute an entry point `repeat` times.
pub async fn execute(artifact: &Path, options: RunOptions) -> anyhow::Result<()> {
    let input = parse_input(&options.input)?;

    let mut config = RuntimeConfig::from_env();
    config.pool.enabled = options.pooling;
    let budget = options
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(config.executor.default_timeout);

    let runtime = FunctionRuntime::with_dylibs(config)?;

    let mut failures = 0;
    for _ in 0..options.repeat.max(1) {
        let result = runtime
            .execute(
                &options.function_id,
                artifact,
                &options.entry,
                input.clone(),
                ExecutionContext::new(budget),
            )
            .await
            .with_context(|| format!("cannot run {}", artifact.display()))?;
        if result.status() != Status::Success {
            failures += 1;
        }
        println!("{}", serde_json::to_string(&result)?);
    }

    if options.stats {
        println!("{}", serde_json::to_string_pretty(&runtime.stats())?);
    }

    let stragglers = runtime.shutdown().await;
    if stragglers > 0 {
        tracing::warn!("{} invocations were still running at exit", stragglers);
    }

    if failures > 0 {
        bail!("{} of {} invocations did not succeed", failures, options.repeat.max(1));
    }
    Ok(())
}

fn parse_input(raw: &str) -> anyhow::Result<Input> {
    match serde_json::from_str::<Value>(raw).context("--input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--input must be a JSON object, got {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        let input = parse_input(r#"{"name":"World"}"#).unwrap();
        assert_eq!(input.get("name"), Some(&Value::from("World")));

        assert!(parse_input("[1,2]").is_err());
        assert!(parse_input("{not json").is_err());
    }
}
