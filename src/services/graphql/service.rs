//! GraphQL service: builds the dynamic schema from the introspected model once the database
//! service has started, and holds it for [HttpServerService](crate::services::http_server::HttpServerService)
//! to pick up when it assembles [AppState](crate::app::AppState).

use std::sync::Arc;

use anyhow::{Context, Result};
use async_graphql::dynamic::Schema;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::services::manager::{Service, ServiceHealth};
use crate::services::ServicesManager;

/// Nothing to configure yet — the schema is built entirely from the introspected model. Kept as
/// a struct so callers constructing [GraphqlService] don't need to change if that grows.
#[derive(Debug, Clone, Default)]
pub struct GraphqlServiceConfig {}

/// Builds and holds the dynamic schema. Depends on `"database"` for both the pool and the
/// introspected [Model](crate::model::Model).
pub struct GraphqlService {
    manager: Arc<ServicesManager>,
    schema: RwLock<Option<Schema>>,
}

impl GraphqlService {
    pub fn new(manager: Arc<ServicesManager>, _config: GraphqlServiceConfig) -> Self {
        Self { manager, schema: RwLock::new(None) }
    }

    /// The built schema, if the service has started. `None` before [start](Service::start) runs.
    pub async fn schema(&self) -> Option<Schema> {
        self.schema.read().await.clone()
    }
}

#[async_trait]
impl Service for GraphqlService {
    fn name(&self) -> &str {
        "graphql"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["database".to_string()]
    }

    async fn start(&self) -> Result<()> {
        info!(service = "graphql", "GraphQL service starting");
        let database = self.manager.get_database().await.context("database service not registered")?;
        let db = database.pool().clone();
        let model = database.model().context("database service has not introspected a schema yet")?;

        let schema = crate::gql::build_schema(db, model)
            .map_err(|e| anyhow::anyhow!("failed to build dynamic GraphQL schema: {e:?}"))?;
        *self.schema.write().await = Some(schema);

        info!(service = "graphql", "GraphQL service started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.schema.write().await = None;
        info!(service = "graphql", "GraphQL service stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        if self.schema.read().await.is_some() {
            Ok(ServiceHealth::healthy())
        } else {
            Ok(ServiceHealth::unhealthy("schema not built"))
        }
    }
}
