//! tablecast — introspects a SQL Server/PostgreSQL schema and serves it as a dynamic GraphQL
//! API at `/graphql`, with a binary chunked transport at `/graphql/stream` for large results.

mod app;
mod config;
mod db;
mod dialect;
mod error;
mod filter;
mod gql;
mod model;
mod mutation;
mod plan;
mod rowgraph;
mod services;
mod sql;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::services::graphql::{GraphqlService, GraphqlServiceConfig};
use crate::services::{DatabaseServiceConfig, HttpServerService, ServicesManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tablecast=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(crate::config::Config::from_env().context("loading configuration")?);
    tracing::info!("Configuration loaded");

    let manager = ServicesManager::builder()
        .add_service(DatabaseServiceConfig { database_url: config.database_url.clone(), connect_timeout: config.connect_timeout })
        .build()
        .await
        .context("building services manager")?;

    let graphql = Arc::new(GraphqlService::new(manager.clone(), GraphqlServiceConfig::default()));
    manager.register(graphql.clone()).await;

    let http_server = Arc::new(HttpServerService::new(manager.clone(), graphql.clone(), config.clone()));
    manager.register(http_server.clone()).await;

    manager.start_all().await.context("starting services")?;
    tracing::info!(port = config.port, "tablecast is serving GraphQL at /graphql");

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping services");

    manager.stop_all().await.context("stopping services")?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
