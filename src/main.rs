//! Fake SQL Server - Main entry point.
//!
//! Exposes every target listed in the config file as a local MySQL endpoint.

use fake_sql_server::config::Config;
use fake_sql_server::executor::PipelineFactory;
use fake_sql_server::server::MysqlProxyServer;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    init_tracing(&config);

    info!(
        config = %config.config.display(),
        "Starting Fake SQL Server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let targets = config.load_targets().inspect_err(|e| {
        error!(error = %e, "Invalid configuration");
    })?;
    let settings = Arc::new(config.runops_settings());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = JoinSet::new();

    for target in &targets {
        let cacheable = target.load_cacheable_queries().inspect_err(|e| {
            error!(error = %e, target_name = %target.target, "Failed to load cache files");
        })?;
        info!(
            target_name = %target.target,
            port = target.port,
            type_discovery = target.with_type_discovery,
            cached_queries = cacheable.len(),
            "Exposing target"
        );

        let factory = PipelineFactory::new(
            settings.clone(),
            target.target.clone(),
            target.with_type_discovery,
            cacheable,
        );
        let server = MysqlProxyServer::bind(&config.host, target.port, factory)
            .await
            .inspect_err(|e| error!(error = %e, port = target.port, "Failed to bind"))?;
        servers.spawn(server.serve(shutdown_rx.clone()));
    }

    tokio::select! {
        _ = wait_for_signal() => {
            info!("Shutting down");
            let _ = shutdown_tx.send(true);
        }
        Some(result) = servers.join_next() => {
            // A listener only stops on its own when something went wrong.
            let _ = shutdown_tx.send(true);
            match result {
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task failed"),
                Ok(Ok(())) => warn!("Server stopped unexpectedly"),
            }
        }
    }

    while let Some(result) = servers.join_next().await {
        if let Ok(Err(e)) = result {
            error!(error = %e, "Server error");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
