//! CLI entry point for progdb.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

/// progdb: build a program database from C/C++ translation units.
#[derive(Parser, Debug)]
#[command(name = "progdb", version, about)]
struct Cli {
    /// Path to the progdb.toml configuration file.
    #[arg(default_value = "progdb.toml")]
    config: PathBuf,

    /// Output file path (overrides config).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Abandon a unit on its first recoverable error (overrides config).
    #[arg(long)]
    strict: bool,

    /// Number of worker threads (overrides config).
    #[arg(short, long)]
    jobs: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("progdb=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = progdb::config::load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    cfg.strict |= cli.strict;
    if cli.jobs.is_some() {
        cfg.jobs = cli.jobs;
    }
    let base_dir = cli.config.parent().unwrap_or_else(|| Path::new("."));
    progdb::run_config(&cfg, base_dir, cli.output.as_deref())?;
    Ok(())
}
