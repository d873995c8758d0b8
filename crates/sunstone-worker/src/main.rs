//! Sunstone worker entrypoint
//!
//! Usage: sunstone-worker --run-dir <dir> [--backend <name>]
//!
//! Launched by the orchestrator in its own process group (locally) or under
//! nohup (over SSH). Logs go to stderr, which the launcher redirects into
//! `logs/stderr.log`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use sunstone_worker::{run_worker, MonitorConfig, WorkerOptions};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sunstone-worker", version, about = "Run a Sunstone simulation backend")]
struct Cli {
    /// Run directory containing spec.json
    #[arg(long)]
    run_dir: PathBuf,

    /// Solver backend
    #[arg(long, default_value = "dummy")]
    backend: String,

    /// Resource sampling interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    monitor_interval_ms: u64,

    /// Number of resource samples kept in runtime/resource.json
    #[arg(long, default_value_t = 200)]
    monitor_window: usize,

    /// Disable resource sampling
    #[arg(long)]
    no_monitor: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    if !cli.run_dir.is_dir() {
        error!(run_dir = %cli.run_dir.display(), "run directory does not exist");
        return ExitCode::FAILURE;
    }

    let options = WorkerOptions {
        run_dir: cli.run_dir,
        backend: cli.backend,
        monitor: (!cli.no_monitor).then(|| MonitorConfig {
            interval: Duration::from_millis(cli.monitor_interval_ms.max(1)),
            window: cli.monitor_window.max(1),
        }),
    };

    ExitCode::from(run_worker(&options).exit_code())
}
