//! evalpool server binary.
//!
//! Starts the worker pool and evaluates snippets read line-by-line from
//! standard input, printing each outcome as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use evalpool::config::PoolConfig;
use evalpool::pool::spawn_pool;
use evalpool::supervisor::WorkerSupervisor;

/// Evaluator subprocess pool manager
#[derive(Parser, Debug)]
#[command(name = "evalpool")]
#[command(about = "Evaluator subprocess pool manager", long_about = None)]
struct Args {
    /// Path to the pool configuration file
    #[arg(short, long, default_value = "evalpool.toml")]
    config: PathBuf,

    /// Override the configured interpreter binary
    #[arg(long)]
    interpreter: Option<PathBuf>,

    /// Override the configured worker count
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evalpool=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = PoolConfig::load(&args.config)?;
    if let Some(interpreter) = args.interpreter {
        config.interpreter = interpreter;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    info!("starting evalpool v{}", env!("CARGO_PKG_VERSION"));
    info!(
        interpreter = %config.interpreter.display(),
        workers = config.workers,
        "pool configuration"
    );

    let supervisor = Arc::new(WorkerSupervisor::start(config.worker_config(), config.workers));
    let client = spawn_pool(supervisor.clone(), config.default_max_mem_kib);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match client.eval(line).await {
                        Ok(outcome) => println!("{}", serde_json::to_string(&outcome)?),
                        Err(e) => error!("evaluation failed: {e}"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin read failed: {e}");
                    break;
                }
            },
        }
    }

    info!("shutting down");
    client.shutdown();
    supervisor.shutdown().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C");
        },
        _ = terminate => {
            info!("received terminate signal");
        },
    }
}
