//! kiln orchestrator
//!
//! Watches a CI job queue for jobs that request an ephemeral runner,
//! provisions tagged spot instances for them, and tears everything down
//! again once the jobs finish.

use std::sync::Arc;

use anyhow::Result;
use kiln_orchestrator::{
    api,
    config::Config,
    fleet::{Fleet, HttpFleet, MockFleet},
    queue::{GithubQueue, JobQueue, MockQueue},
    reconciler::Reconciler,
    state::AppState,
    store::JobStore,
    sweep::SweepWorker,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to KILN_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kiln orchestrator");
    info!(
        listen_addr = %config.listen_addr,
        org = %config.github_org,
        "Configuration loaded"
    );

    let store = Arc::new(JobStore::new());

    let (queue, fleet): (Arc<dyn JobQueue>, Arc<dyn Fleet>) = if config.dev_mode {
        warn!("Dev mode: using in-memory queue and fleet clients");
        (Arc::new(MockQueue::new()), Arc::new(MockFleet::new()))
    } else {
        let queue = GithubQueue::new(
            &config.github_api_base,
            &config.github_org,
            config.github_repo.clone(),
            &config.github_token,
            config.call_timeout,
        )?;
        let fleet_base = config
            .fleet_api_base
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("KILN_FLEET_API_BASE is required outside dev mode"))?;
        let fleet = HttpFleet::new(
            fleet_base,
            config.fleet_api_token.as_deref(),
            config.call_timeout,
        )?;
        (Arc::new(queue), Arc::new(fleet))
    };

    let reconciler = Arc::new(Reconciler::new(
        config.reconciler(),
        store.clone(),
        queue,
        fleet,
        config.selector(),
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (signal_tx, signal_rx) = mpsc::channel(64);

    // Start the reconcile loop in background
    let reconcile_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx, signal_rx).await;
        }
    });

    // Start the sweep worker in background
    let sweep_worker = SweepWorker::new(reconciler.clone(), config.sweep_interval);
    let sweep_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sweep_worker.run(shutdown_rx).await;
        }
    });

    // Create application state
    let state = AppState::new(config.clone(), store, reconciler, signal_tx);

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reconcile_handle).await {
        warn!(error = %e, "Reconciler did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, sweep_handle).await {
        warn!(error = %e, "Sweep worker did not shut down in time");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
