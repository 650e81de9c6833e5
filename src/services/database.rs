//! Database service: owns the connection pool and the introspected [`Model`] built from it at
//! startup, for lifecycle (start/stop/health) and dependency wiring.
//!
//! Other services that need the database or the schema model should declare
//! `dependencies: ["database"]`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::db::{connect_with_retry, DbPool};
use crate::model::{Model, SchemaReader};
use crate::services::manager::{Service, ServiceHealth};

/// Configuration for the database service (connection URL, timeouts, etc.).
#[derive(Debug, Clone)]
pub struct DatabaseServiceConfig {
    /// `postgres://...` or `mssql://...` (dispatch is on scheme, see [crate::db]).
    pub database_url: String,
    /// How long to retry connecting before giving up.
    pub connect_timeout: Duration,
}

/// Service that owns the database pool and the schema `Model` introspected from it.
/// Register this first so that services depending on `"database"` can start after it.
pub struct DatabaseService {
    pool: DbPool,
    model: RwLock<Option<Arc<Model>>>,
}

impl DatabaseService {
    /// Create a new database service with an already-connected pool. The schema model is built
    /// on [start](Service::start), not here, so construction never touches the network.
    pub fn new(pool: DbPool) -> Self {
        Self { pool, model: RwLock::new(None) }
    }

    /// Create and connect the database service from config.
    pub async fn from_config(config: DatabaseServiceConfig) -> Result<Self> {
        let pool = connect_with_retry(&config.database_url, config.connect_timeout)
            .await
            .context("Database service: connect_with_retry failed")?;
        Ok(Self::new(pool))
    }

    /// Access the pool (e.g. to clone for app state). Valid until [Service::stop] is called.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// The introspected schema. `None` until [start](Service::start) has run.
    pub fn model(&self) -> Option<Arc<Model>> {
        self.model.read().clone()
    }
}

#[async_trait]
impl Service for DatabaseService {
    fn name(&self) -> &str {
        "database"
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn start(&self) -> Result<()> {
        info!(service = "database", "Database service starting");
        self.pool.ping().await.context("database ping failed")?;

        info!(service = "database", "Introspecting schema");
        let model = SchemaReader::read(&self.pool).await.context("schema introspection failed")?;
        info!(service = "database", tables = model.visible_tables().count(), "Schema introspected");
        *self.model.write() = Some(Arc::new(model));

        info!(service = "database", "Database service started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.pool.close().await;
        info!(service = "database", "Database service stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        match self.pool.ping().await {
            Ok(()) => Ok(ServiceHealth::healthy()),
            Err(e) => {
                warn!(service = "database", error = %e, "Health check failed");
                Ok(ServiceHealth::unhealthy(e.to_string()))
            }
        }
    }
}
