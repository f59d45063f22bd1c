use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use windowkeeper::config::WindowkeeperConfig;
use windowkeeper::store::WindowStore;
use windowkeeper::SlidingWindowLimiter;

/// Sliding-window rate limiter backed by a shared Redis store.
#[derive(Debug, Parser)]
#[command(name = "windowkeeper", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON); WINDOWKEEPER__* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to the store and check that it answers
    Ping,
    /// Ask the limiter to admit requests for an identifier
    Admit {
        /// Caller identifier
        identifier: String,

        /// Number of requests to issue
        #[arg(short = 'n', long, default_value_t = 1)]
        requests: u32,

        /// Issue all requests at once instead of one after another
        #[arg(long)]
        concurrent: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Windowkeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = WindowkeeperConfig::load(cli.config.as_deref())?;
    info!(endpoint = %config.store.endpoint(), "Configuration loaded");

    let limiter = Arc::new(SlidingWindowLimiter::connect(&config).await?);

    let outcome = tokio::select! {
        result = run(cli.command, limiter.clone()) => result,
        _ = shutdown_signal() => Ok(()),
    };

    limiter.shutdown().await;
    info!("Windowkeeper stopped");
    outcome
}

async fn run(command: Command, limiter: Arc<SlidingWindowLimiter>) -> anyhow::Result<()> {
    match command {
        Command::Ping => {
            println!("store at {} is alive", limiter.store().endpoint());
        }
        Command::Admit {
            identifier,
            requests,
            concurrent,
        } => {
            let decisions = if concurrent {
                join_all((0..requests).map(|_| limiter.try_admit(&identifier)))
                    .await
                    .into_iter()
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                let mut decisions = Vec::with_capacity(requests as usize);
                for _ in 0..requests {
                    decisions.push(limiter.try_admit(&identifier).await?);
                }
                decisions
            };

            for (i, allowed) in decisions.iter().enumerate() {
                let verdict = if *allowed { "allowed" } else { "denied" };
                println!("{} request {}: {}", identifier, i + 1, verdict);
            }
            let allowed = decisions.iter().filter(|allowed| **allowed).count();
            println!("{}/{} allowed", allowed, decisions.len());
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
