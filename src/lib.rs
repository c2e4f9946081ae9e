//! pg_upkeep - a self-driving performance watchdog for PostgreSQL.
//!
//! The daemon owns a connection pool, continuously samples the
//! server's statistics views, and emits prioritized findings through
//! pluggable sinks. Under an explicit opt-in it can also apply a small
//! closed set of safe fixes (ANALYZE, plain index creation).

pub mod bulk;
pub mod cli;
pub mod config;
pub mod connection;
pub mod db;
pub mod history;
pub mod pool;
pub mod runtime;
pub mod scheduler;
pub mod ssl;
pub mod statement_cache;
pub mod upholder;

use clap::Parser;
use cli::Cli;
use color_eyre::eyre::Result;
use tracing_subscriber::EnvFilter;

/// Main entry point - parses CLI args and runs the daemon.
pub fn run_cli() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(runtime::run(cli))
}

/// Map verbosity count to a default tracing level; `RUST_LOG` wins
/// when set.
const fn verbosity_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_level(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| color_eyre::eyre::eyre!("failed to initialize tracing: {e}"))?;
    Ok(())
}
