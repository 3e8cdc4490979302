//! Publish-and-run runner
//!
//! Runs a variation matrix against the storefront and writes
//! `test-results.json`. Exits with status 1 when any variation failed.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storefront_e2e::{HarnessConfig, HarnessContext, MatrixRunner, RunnerConfig, VariationMatrix};

#[derive(Parser)]
#[command(name = "publish-and-run")]
#[command(about = "Publish the storefront per variation, run it and validate it")]
#[command(version)]
struct Cli {
    /// Harness configuration file (defaults apply when absent)
    #[arg(short, long, default_value = "e2e/harness.toml")]
    config: PathBuf,

    /// Matrix YAML file or directory of files (default: built-in matrix)
    #[arg(short, long)]
    matrix: Option<PathBuf>,

    /// Application tree to publish, overrides the configuration
    #[arg(long, env = "STOREFRONT_APP_PATH")]
    app_path: Option<PathBuf>,

    /// Variations run at the same time
    #[arg(long, default_value = "1")]
    concurrency: usize,

    /// Directory for test-results.json
    #[arg(short, long, default_value = "test-results")]
    output: PathBuf,

    /// Only run variations with this tag
    #[arg(short, long)]
    tag: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(cli.json_logs.then(|| fmt::layer().json()))
        .with((!cli.json_logs).then(fmt::layer))
        .with(filter)
        .init();

    info!("Publish-and-run harness v{}", env!("CARGO_PKG_VERSION"));

    let mut config = HarnessConfig::load(&cli.config)?;
    if let Some(app_path) = cli.app_path {
        config.application_path = app_path;
    }

    let matrix = match &cli.matrix {
        Some(path) if path.is_dir() => VariationMatrix::load_all(path)?,
        Some(path) => VariationMatrix::from_file(path)?,
        None => VariationMatrix::default(),
    };
    info!(
        "Loaded matrix '{}' with {} variation(s), application at {}",
        matrix.name,
        matrix.variations.len(),
        config.application_path.display()
    );

    let ctx = HarnessContext::from_config(config)?;
    let runner = MatrixRunner::new(
        ctx,
        RunnerConfig {
            concurrency: cli.concurrency,
            output_dir: cli.output,
        },
    );

    let results = match &cli.tag {
        Some(tag) => runner.run_tagged(&matrix, tag).await,
        None => runner.run(&matrix).await,
    };
    runner.write_results(&results)?;

    if !results.success() {
        std::process::exit(1);
    }
    Ok(())
}
