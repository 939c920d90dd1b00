//! ExperiFlow edge proxy binary.

mod config;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use experiflow_assign::Assigner;
use experiflow_client::ApiClient;
use experiflow_engine::Orchestrator;

use crate::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing; RUST_LOG wins over --verbose.
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let assigner = Assigner::new(cli.salt.clone()).context("EXPERIFLOW_SALT must be set to a non-empty secret")?;

    let mut api = ApiClient::new(cli.api_url.clone()).with_timeout(cli.transform_timeout)?;
    if let Some(token) = &cli.edge_token {
        api = api.with_edge_token(token.clone());
    }

    let config = cli.orchestrator_config();
    info!(port = cli.port, origin = %cli.origin_url, api = %cli.api_url, "Starting ExperiFlow proxy");
    if config.experiment_ids.is_empty() {
        warn!("No experiment IDs configured; running as a pass-through proxy. Set EXPERIMENT_IDS to enable experiments.");
    } else {
        info!(
            experiments = ?config.experiment_ids,
            transform_timeout_ms = config.transform_timeout.as_millis() as u64,
            "Active experiments"
        );
    }

    let orchestrator = Orchestrator::new(config, assigner, Arc::new(api));
    let state = server::AppState::new(cli.origin_url.clone(), orchestrator, cli.read_timeout)?;
    let app = server::router(state, cli.write_timeout);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Ready to accept requests on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;
    Ok(())
}
