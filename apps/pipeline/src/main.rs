use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use logger::LogFormat;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use uppe_pipeline::config::Config;
use uppe_pipeline::orchestrator::{Orchestrator, Role};

/// Uppe check-dispatch pipeline
#[derive(Parser, Debug)]
#[command(name = "uppe-pipeline", version, about = "Runs one role of the uptime check pipeline", long_about = None)]
struct Args {
    /// Configuration file, created with defaults when missing
    #[arg(short, long, env = "UPPE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fire enabled checks on their schedule and publish jobs
    Scheduler,
    /// Execute jobs for one region/sub-region
    Worker {
        /// Region id (overrides config)
        #[arg(long, env = "UPPE_REGION")]
        region: Option<String>,

        /// Sub-region id (overrides config)
        #[arg(long, env = "UPPE_SUBREGION")]
        subregion: Option<String>,

        /// Number of concurrent workers (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Store outcomes in batches
    Collector,
    /// Record status changes from stored outcomes
    Detector,
    /// Purge old outcomes
    Retention,
    /// Every role in one process over the in-process broker
    Standalone,
}

impl Command {
    /// Apply command line overrides and pick the role
    fn apply(self, config: &mut Config) -> Role {
        match self {
            Command::Scheduler => Role::Scheduler,
            Command::Worker { region, subregion, concurrency } => {
                if let Some(region) = region {
                    config.worker.region = region;
                }
                if let Some(subregion) = subregion {
                    config.worker.subregion = subregion;
                }
                if let Some(concurrency) = concurrency {
                    config.worker.concurrency = concurrency.max(1);
                }
                Role::Worker
            }
            Command::Collector => Role::Collector,
            Command::Detector => Role::Detector,
            Command::Retention => Role::Retention,
            Command::Standalone => {
                config.broker.url = "memory://".into();
                Role::Standalone
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match Config::from_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("uppe-pipeline: {e}");
            return ExitCode::FAILURE;
        }
    };
    let format = config.logging.format.parse::<LogFormat>().unwrap_or_default();
    logger::init(&config.logging.level, format);

    let role = args.command.apply(&mut config);
    info!(role = role.as_str(), version = env!("CARGO_PKG_VERSION"), "Starting uppe-pipeline");
    info!("Configuration:\n{config}");

    let shutdown = CancellationToken::new();
    let orchestrator = match Orchestrator::new(config, shutdown.clone()).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "Failed to start");
            return ExitCode::FAILURE;
        }
    };

    let signals = tokio::spawn(cancel_on_signal(shutdown.clone()));
    let result = orchestrator.run(role).await;
    shutdown.cancel();
    signals.abort();

    match result {
        Ok(()) => {
            info!(role = role.as_str(), "Stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(role = role.as_str(), error = %e, "Pipeline role failed");
            ExitCode::FAILURE
        }
    }
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        }
        _ = terminate => {}
        _ = shutdown.cancelled() => return,
    }
    info!("Shutdown requested");
    shutdown.cancel();
}
