//! fnhost CLI - run isolated function artifacts from the command line.

mod inspect;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "fnhost")]
#[command(about = "Run isolated, pooled function artifacts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an entry point from an artifact
    Run {
        /// Path to the artifact (shared library)
        artifact: PathBuf,

        /// Fully qualified entry type, e.g. hello.Hello
        entry: String,

        /// Function identity used as the pool key (default: entry type)
        #[arg(long)]
        function: Option<String>,

        /// Input object as JSON
        #[arg(long, default_value = "{}")]
        input: String,

        /// Budget per invocation in milliseconds (default: FNHOST_DEFAULT_TIMEOUT_MS)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Run the invocation this many times
        #[arg(long, default_value = "1")]
        repeat: u32,

        /// Build a fresh loader for every invocation
        #[arg(long)]
        no_pool: bool,

        /// Print pool statistics afterwards
        #[arg(long)]
        stats: bool,
    },

    /// List the types an artifact declares
    Inspect {
        /// Path to the artifact (shared library)
        artifact: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            artifact,
            entry,
            function,
            input,
            timeout_ms,
            repeat,
            no_pool,
            stats,
        } => {
            let options = run::RunOptions {
                function_id: function.unwrap_or_else(|| entry.clone()),
                entry,
                input,
                timeout_ms,
                repeat,
                pooling: !no_pool,
                stats,
            };
            run::execute(&artifact, options).await?;
        }

        Commands::Inspect { artifact } => inspect::execute(&artifact)?,
    }

    Ok(())
}
