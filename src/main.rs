//! # Runwarden - controller entry point
//!
//! ## Initialization Sequence
//!
//! 1. **Configuration** - Load the optional TOML file and apply CLI overrides
//! 2. **Tracing** - `RUST_LOG` wins, then the configured `log_level`
//! 3. **Store** - In-memory object store wrapped with tracing
//! 4. **Controllers** - Pipeline and step controllers over the store
//! 5. **Run** - Until Ctrl+C, or until every seeded run is terminal
//!
//! ## Shutdown
//!
//! Ctrl+C cancels the root token. Each controller stops accepting work, lets
//! in-flight reconciles finish, and returns. A fatal engine error cancels
//! everything and exits non-zero.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use runwarden::cli::{Cli, Commands};
use runwarden::config::AppConfig;
use runwarden::demo::{self, Demo, PipelineSpec};
use runwarden_events::{InMemoryObjectStore, ObjectStore, TracingObjectStore};
use runwarden_reconciler::TracingMetricsSink;

const DONE_POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?
        .with_cli_overrides(&cli);

    init_tracing(&config.log_level);
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Run {
            runs,
            steps,
            step_ms,
            exit_when_done,
        } => {
            let spec = PipelineSpec {
                steps,
                step_ms,
                ..PipelineSpec::default()
            };
            run(&config, runs, &spec, exit_when_done).await
        }
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(
    config: &AppConfig,
    runs: usize,
    spec: &PipelineSpec,
    exit_when_done: bool,
) -> Result<()> {
    let start_time = Instant::now();
    info!("Runwarden starting...");

    let store: Arc<dyn ObjectStore> =
        Arc::new(TracingObjectStore::new(InMemoryObjectStore::new()));
    let demo = Demo::build(store.clone(), &config.controller, Arc::new(TracingMetricsSink))
        .context("Failed to build controllers")?;

    let namespace = config.controller.namespace.as_deref().unwrap_or("default");
    let keys = demo::seed_runs(store.as_ref(), namespace, runs, spec)
        .await
        .context("Failed to seed pipeline runs")?;

    let cancel = CancellationToken::new();
    let mut engine = {
        let demo = demo.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { demo.run(cancel).await })
    };
    info!(
        workers = config.controller.workers,
        timeout_secs = config.controller.timeout_secs,
        "Runwarden started in {:?}",
        start_time.elapsed()
    );

    let finished = async {
        if !exit_when_done {
            info!("Runwarden is running. Press Ctrl+C to stop.");
            return std::future::pending().await;
        }
        while !demo.all_terminal(&keys) {
            tokio::time::sleep(DONE_POLL).await;
        }
        info!(runs = keys.len(), "All pipeline runs finished");
    };

    tokio::select! {
        () = wait_for_shutdown() => {}
        () = finished => {}
        joined = &mut engine => {
            joined
                .context("Controller task panicked")?
                .context("Controller stopped with an error")?;
            report(&demo, &keys);
            return Ok(());
        }
    }

    cancel.cancel();
    engine
        .await
        .context("Controller task panicked")?
        .context("Controller stopped with an error")?;

    report(&demo, &keys);
    info!("Runwarden stopped gracefully");
    Ok(())
}

fn report(demo: &Demo, keys: &[runwarden_core::Key]) {
    for key in keys {
        match demo.pipelines.cache().get(key) {
            Some(run) => info!(
                key = %key,
                phase = %run.phase,
                message = run.message.as_deref().unwrap_or(""),
                "Pipeline run"
            ),
            None => error!(key = %key, "Pipeline run missing from cache"),
        }
    }
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
