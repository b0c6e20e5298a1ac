//! shardkeeper - shard orchestrator daemon
//!
//! - Resolves the shard total and session window from upstream
//! - Spawns local worker processes or registers remote peers
//! - Monitors heartbeats and respawns failed workers within bounds
//! - Exposes health/ready endpoints and Prometheus metrics

use anyhow::Result;
use shardkeeper::config::Config;
use shardkeeper::health::{self, AppState};
use shardkeeper::http::HttpSessionSource;
use shardkeeper::metrics::OrchestratorMetrics;
use shardkeeper::orchestrator::Orchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let (config, token) = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shardkeeper={}", config.log_level).parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        shard_count = ?config.shard_count,
        mode = ?config.mode,
        "Starting shardkeeper"
    );

    let metrics = Arc::new(OrchestratorMetrics::new());
    info!("Prometheus metrics initialized");

    let source = HttpSessionSource::new(config.upstream_url.clone());
    let http_port = config.http_port;

    let orchestrator = match Orchestrator::boot(config, token, &source).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            metrics.record_error(e.error_type_label());
            error!(error = %e, "Startup failed");
            return Err(e.into());
        }
    };
    let handle = orchestrator.handle();

    // Log the outward event stream; a broker bridge would subscribe here too.
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(
                worker_id = event.worker_id,
                kind = ?event.kind,
                "Worker event"
            );
        }
    });

    let app_state = AppState {
        orchestrator: handle.clone(),
        metrics: Arc::clone(&metrics),
    };
    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], http_port).into();

    info!(port = http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    // The run loop must not be cancelled by the select below: its exit path
    // delivers Shutdown frames to every worker and waits out the kill grace
    // period. Run it as a task and await it after the shutdown trigger.
    let mut run = tokio::spawn(orchestrator.run());

    let run_result = tokio::select! {
        result = &mut run => Some(result),
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
            None
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            None
        }
    };

    // Graceful shutdown: trigger the flag, then let the run loop drain.
    info!("Shutting down orchestrator...");
    handle.shutdown();
    let run_result = match run_result {
        Some(result) => result,
        None => run.await,
    };
    match run_result {
        Ok(Err(e)) => {
            metrics.record_error(e.error_type_label());
            error!(error = %e, "Orchestrator error");
        }
        Err(e) => error!(error = %e, "Orchestrator task aborted"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
