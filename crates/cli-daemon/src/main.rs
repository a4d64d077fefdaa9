//! CLI entry point for the Avior encode worker
//!
//! Parses command line arguments, installs logging and runs the scheduling
//! loop until Ctrl-C.

use avior::{machine_hostname, new_shared_config, Config, FfmpegEncoder, FileJobStore, Service};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Avior - leases encode jobs and decides what happens to each recording
#[derive(Parser, Debug)]
#[command(name = "avior")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Directory holding the job and client store
    #[arg(short, long, default_value = "state")]
    state_dir: PathBuf,

    /// Log filter, e.g. `avior=debug`. Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("avior=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    info!("Avior starting, config file: {}", args.config.display());
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = new_shared_config(config);
    let encoder = Arc::new(FfmpegEncoder::new(config.clone()));
    let store = Arc::new(FileJobStore::new(&args.state_dir));
    let hostname = machine_hostname();
    info!("Running as client {}", hostname);

    let service = Service::new(config, Some(args.config.clone()), store, encoder, hostname);
    let handle = service.handle();

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.shutdown();
        }
    });

    match service.run().await {
        Ok(()) => {
            info!("Avior stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Service error: {}", e);
            ExitCode::FAILURE
        }
    }
}
