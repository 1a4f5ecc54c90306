//! kustomux - multiplexing MCP router for Azure Data Explorer clusters
//!
//! Startup order: parse config, bring up the cluster fleet in parallel,
//! build the merged tool catalog, expose the MCP surface on stdio, start
//! the health loop, then wait for a shutdown trigger (SIGINT, SIGTERM, or
//! the client closing stdin). Shutdown reverses that order.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use kustomux::config::{Cli, Config};
use kustomux::events::EndpointEventSender;
use kustomux::health::HealthLoop;
use kustomux::logging;
use kustomux::router::Router;
use kustomux::schema::SharedCatalog;
use kustomux::server::MuxServer;
use kustomux::supervisor::Supervisor;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("kustomux: {err}");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = logging::init(&config) {
        eprintln!("kustomux: failed to initialize logging: {err:#}");
        return ExitCode::from(1);
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "fatal error, shutting down");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        clusters = config.mappings.len(),
        "starting kustomux"
    );

    let events = EndpointEventSender::default();
    let supervisor = Arc::new(Supervisor::new(&config, events));

    let connected = supervisor.init_all(&config.mappings).await;
    if connected == 0 {
        anyhow::bail!("no clusters connected after initialization");
    }

    let catalog = SharedCatalog::new();
    let tool_count = catalog.refresh_from(&supervisor).await;
    if tool_count == 0 {
        supervisor.shutdown_all().await;
        anyhow::bail!("no tools discovered from any connected cluster");
    }
    info!(tool_count, connected, "tool catalog ready");

    let router = Arc::new(Router::new(supervisor.clone(), catalog.clone()));
    let service = match MuxServer::new(router, catalog).serve_stdio().await {
        Ok(service) => service,
        Err(e) => {
            supervisor.shutdown_all().await;
            return Err(e);
        }
    };
    let upstream_cancel = service.cancellation_token();

    let health = HealthLoop::new(supervisor.clone(), &config);
    health.start();

    let upstream_done = tokio::spawn(async move {
        let _ = service.waiting().await;
    });

    let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler");
    let mut sigterm = match sigterm {
        Ok(sigterm) => sigterm,
        Err(e) => {
            health.stop();
            upstream_cancel.cancel();
            supervisor.shutdown_all().await;
            return Err(e);
        }
    };
    tokio::select! {
        _ = upstream_done => info!("upstream transport closed, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    // First trigger wins; anything arriving later is ignored while the
    // teardown below runs.
    health.stop();
    upstream_cancel.cancel();
    supervisor.shutdown_all().await;
    info!("shutdown complete");
    Ok(())
}
