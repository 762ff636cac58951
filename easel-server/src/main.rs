//! easel-server entry point.
//!
//! Startup order:
//! 1. Parse arguments (flags or `EASEL_*` environment variables).
//! 2. Initialise tracing.
//! 3. Create the models and outputs directories.
//! 4. Select the compute device and build the orchestrator.
//! 5. Serve the router until ctrl-c or SIGTERM.

mod config;
mod error;
mod middleware;
mod routes;
mod state;

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use easel_core::{CandleFactory, Orchestrator};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Args;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match args.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: log level '{}' is not a valid tracing filter ({}); falling back to 'info'",
                    args.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "easel-server starting");

    for dir in [&args.models_dir, &args.outputs_dir] {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    // Device selection happens once, before the first request.
    let factory = CandleFactory::from_device_map(args.device_map());
    let orchestrator = Orchestrator::new(args.orchestrator_config(), Arc::new(factory));
    info!(
        models_dir = %args.models_dir.display(),
        outputs_dir = %args.outputs_dir.display(),
        "orchestrator ready"
    );

    let state = Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        bridge: args.bridge_options(),
        cors_origins: args.cors_origins(),
    });
    let app = routes::build(state);

    let bind_address = args.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(address = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("easel-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
