//! CLI entry point for the ingest daemon
//!
//! Parses command line arguments, initialises logging and starts the daemon.

use clap::Parser;
use ingest_daemon::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Ingest Daemon - watch-folder media ingestion and delivery-profile conversion
#[derive(Parser, Debug)]
#[command(name = "ingest-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg, ffprobe, normalizer). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ingest_daemon=info,ingest_daemon_cli=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    info!(config = %args.config.display(), version = env!("CARGO_PKG_VERSION"), "Ingest daemon starting");

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = daemon.check_tools() {
        error!(error = %e, "Startup checks failed");
        return ExitCode::FAILURE;
    }

    if daemon.config.metrics.enabled {
        info!(listen = %daemon.config.metrics.listen, "Serving metrics on /metrics");
    }

    if let Err(e) = daemon.run().await {
        error!(error = %e, "Daemon error");
        return ExitCode::FAILURE;
    }

    info!("Ingest daemon stopped");
    ExitCode::SUCCESS
}
