//! Inspect command implementation for the fnhost CLI.

use std::path::Path;
use std::sync::Arc;

use fnhost_core::{DylibOpener, HostContext, IsolatedLoader, LoaderConfig};

/// Print every declared type and whether it can serve as an entry point.
pub fn execute(artifact: &Path) -> anyhow::Result<()> {
    let config = LoaderConfig::from_env();
    let host = Arc::new(
        HostContext::builder()
            .policy(config.namespace_policy())
            .build()?,
    );
    let opener = DylibOpener::new(config.scratch_dir);
    let loader = IsolatedLoader::open(artifact, &opener, host)?;
    let contract = loader.function_contract()?;

    println!("{} ({})", artifact.display(), loader.id());
    for name in loader.declared_types()? {
        match loader.resolve(&name) {
            Ok(ty) => {
                let entry_point = ty.implements(&contract) && ty.is_constructible();
                println!(
                    "  {:<40} {}",
                    name,
                    if entry_point { "entry point" } else { "-" }
                );
            }
            Err(e) => println!("  {:<40} unresolvable: {}", name, e),
        }
    }

    loader.close();
    Ok(())
}
