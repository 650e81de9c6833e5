//! Global services manager for long-running and background services.
//!
//! Services register with the manager and are started/stopped/restarted together.
//! Start order respects [dependencies](Service::dependencies); a service is only
//! started after all of its dependencies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::services::database::{DatabaseService, DatabaseServiceConfig};

/// Health status of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a service health check.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceHealth {
    pub fn healthy() -> Self {
        Self { status: HealthStatus::Healthy, message: None }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Degraded, message: Some(message.into()) }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Unhealthy, message: Some(message.into()) }
    }
}

/// A service that can be started, stopped, restarted, and health-checked by the manager.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Unique name for logging and lookup (e.g. "database").
    fn name(&self) -> &str;

    /// Names of services that must be started before this one. Start order is
    /// computed from this; cycles are an error.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Start background tasks or connections. Idempotent allowed.
    async fn start(&self) -> Result<()>;

    /// Stop background tasks and release resources. Idempotent allowed.
    async fn stop(&self) -> Result<()>;

    /// Restart the service: stop then start. Override if you need atomic or
    /// non-sequential restart behaviour.
    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Report current health. Used by the manager and by `/healthz`.
    async fn health(&self) -> Result<ServiceHealth> {
        Ok(ServiceHealth::healthy())
    }
}

/// Pending registration for the builder.
enum ServiceRegistration {
    Database(DatabaseServiceConfig),
    Service(Arc<dyn Service>),
}

/// Types that can be added to a [ServicesManagerBuilder] via [add_service](ServicesManagerBuilder::add_service).
pub trait IntoServiceRegistration {
    #[doc(hidden)]
    fn into_registration(self) -> ServiceRegistration;
}

impl IntoServiceRegistration for DatabaseServiceConfig {
    fn into_registration(self) -> ServiceRegistration {
        ServiceRegistration::Database(self)
    }
}

impl IntoServiceRegistration for Arc<dyn Service> {
    fn into_registration(self) -> ServiceRegistration {
        ServiceRegistration::Service(self)
    }
}

/// Builder for [ServicesManager]: add services with configs, then [build](ServicesManagerBuilder::build) or [start](ServicesManagerBuilder::start).
pub struct ServicesManagerBuilder {
    registrations: Vec<ServiceRegistration>,
}

impl ServicesManagerBuilder {
    pub fn new() -> Self {
        Self { registrations: Vec::new() }
    }

    /// Add a service: a [DatabaseServiceConfig] or a pre-built [Arc]\[[dyn](Service)\].
    /// Config-based services are instantiated when [build](Self::build) or [start](Self::start)
    /// is called.
    pub fn add_service<T: IntoServiceRegistration>(mut self, t: T) -> Self {
        self.registrations.push(t.into_registration());
        self
    }

    /// Build the manager and register all services. Does not start them.
    pub async fn build(self) -> Result<Arc<ServicesManager>> {
        let manager = Arc::new(ServicesManager::new());
        for reg in self.registrations {
            match reg {
                ServiceRegistration::Database(config) => {
                    let db_svc = Arc::new(
                        DatabaseService::from_config(config)
                            .await
                            .context("Failed to create database service from config")?,
                    );
                    manager.register_database(db_svc).await;
                }
                ServiceRegistration::Service(svc) => {
                    manager.register(svc).await;
                }
            }
        }
        Ok(manager)
    }

    /// Build the manager, register all services, and start them in dependency order.
    pub async fn start(self) -> Result<Arc<ServicesManager>> {
        let manager = self.build().await?;
        manager.start_all().await?;
        Ok(manager)
    }
}

impl Default for ServicesManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Global registry and lifecycle controller for services.
pub struct ServicesManager {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
    started: RwLock<HashSet<String>>,
    database: RwLock<Option<Arc<DatabaseService>>>,
}

impl Default for ServicesManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServicesManager {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            started: RwLock::new(HashSet::new()),
            database: RwLock::new(None),
        }
    }

    /// Create a builder to add services with configs and then build/start.
    pub fn builder() -> ServicesManagerBuilder {
        ServicesManagerBuilder::new()
    }

    /// Compute start order from dependencies (topological order). Returns an error on unknown deps or cycles.
    async fn start_order(&self) -> Result<Vec<String>> {
        let guard = self.services.read().await;
        let names: HashSet<String> = guard.keys().cloned().collect();
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        for (name, svc) in guard.iter() {
            let d = svc.dependencies();
            for dep in &d {
                if !names.contains(dep) {
                    anyhow::bail!("Service {} depends on {} which is not registered", name, dep);
                }
            }
            deps.insert(name.clone(), d);
        }
        drop(guard);

        let mut in_degree: HashMap<String, usize> = deps.iter().map(|(name, d)| (name.clone(), d.len())).collect();
        let mut dependent_on: HashMap<String, Vec<String>> = names.iter().map(|n| (n.clone(), Vec::new())).collect();
        for (name, d) in &deps {
            for dep in d {
                dependent_on.get_mut(dep).unwrap().push(name.clone());
            }
        }
        let mut queue: Vec<String> = in_degree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| n.clone()).collect();
        let mut order = Vec::with_capacity(names.len());
        while let Some(n) = queue.pop() {
            order.push(n.clone());
            for s in dependent_on.get(&n).unwrap_or(&vec![]) {
                let deg = in_degree.get_mut(s).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push(s.clone());
                }
            }
        }
        if order.len() != names.len() {
            anyhow::bail!("Service dependency cycle detected");
        }
        Ok(order)
    }

    /// Register a service. Does not start it. If a service with the same name
    /// exists, it is replaced (the previous instance is not stopped).
    pub async fn register(&self, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        if name == "database" {
            warn!("Use register_database() to register the database service so get_database() works");
        }
        let mut guard = self.services.write().await;
        if guard.insert(name.clone(), service).is_some() {
            warn!(service = %name, "Service '{}' reregistered, overwriting previous", name);
        } else {
            info!(service = %name, "Service '{}' registered", name);
        }
    }

    /// Register the database service. This is the only way to make [get_database] return a value.
    pub async fn register_database(&self, service: Arc<DatabaseService>) {
        let name = service.name().to_string();
        *self.database.write().await = Some(service.clone());
        let mut guard = self.services.write().await;
        if guard.insert(name.clone(), service).is_some() {
            warn!(service = %name, "Service '{}' reregistered, overwriting previous", name);
        } else {
            info!(service = %name, "Service '{}' registered", name);
        }
    }

    /// Return the database service if it is registered and currently **started**.
    pub async fn get_database(&self) -> Option<Arc<DatabaseService>> {
        if !self.started.read().await.contains("database") {
            return None;
        }
        self.database.read().await.clone()
    }

    /// Return the database service if registered, regardless of started state.
    pub async fn get_database_unchecked(&self) -> Option<Arc<DatabaseService>> {
        self.database.read().await.clone()
    }

    /// Unregister a service by name. Does not stop it. Returns the previous service if present.
    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.started.write().await.remove(name);
        if name == "database" {
            *self.database.write().await = None;
        }
        let mut guard = self.services.write().await;
        let out = guard.remove(name);
        if out.is_some() {
            info!(service = %name, "Service '{}' unregistered", name);
        }
        out
    }

    /// Start all registered services in dependency order (dependencies first).
    pub async fn start_all(&self) -> Result<()> {
        let order = self.start_order().await?;
        for name in &order {
            let svc = {
                let g = self.services.read().await;
                g.get(name).cloned()
            };
            if let Some(s) = svc {
                if let Err(e) = s.start().await {
                    warn!(service = %name, error = %e, "Service '{}' start failed", name);
                    return Err(e).context(format!("failed to start service {}", name));
                }
                self.started.write().await.insert(name.clone());
                info!(service = %name, "Service '{}' started", name);
            }
        }
        Ok(())
    }

    /// Stop all registered services in reverse dependency order (dependents first).
    pub async fn stop_all(&self) -> Result<()> {
        let order = self.start_order().await?;
        for name in order.into_iter().rev() {
            let svc = {
                let g = self.services.read().await;
                g.get(&name).cloned()
            };
            if let Some(s) = svc {
                if let Err(e) = s.stop().await {
                    warn!(service = %name, error = %e, "Service '{}' stop failed", name);
                } else {
                    info!(service = %name, "Service '{}' stopped", name);
                }
                self.started.write().await.remove(&name);
            }
        }
        Ok(())
    }

    /// Restart a single service by name. Dependencies are not restarted.
    pub async fn restart_one(&self, name: &str) -> Result<()> {
        let svc = {
            let guard = self.services.read().await;
            guard.get(name).cloned()
        };
        match svc {
            Some(s) => {
                s.stop().await?;
                self.started.write().await.remove(name);
                s.start().await?;
                self.started.write().await.insert(name.to_string());
                info!(service = %name, "Service '{}' restarted", name);
                Ok(())
            }
            None => anyhow::bail!("Service not found: {}", name),
        }
    }

    /// Restart all registered services: stop all in reverse order, then start all.
    pub async fn restart_all(&self) -> Result<()> {
        self.stop_all().await?;
        self.start_all().await
    }

    /// Stop a single service by name. Returns whether it was found and stopped successfully.
    pub async fn stop_one(&self, name: &str) -> bool {
        let svc = {
            let guard = self.services.read().await;
            guard.get(name).cloned()
        };
        if let Some(s) = svc {
            match s.stop().await {
                Ok(()) => {
                    self.started.write().await.remove(name);
                    info!(service = %name, "Service '{}' stopped", name);
                    true
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "Service '{}' stop failed", name);
                    false
                }
            }
        } else {
            warn!(service = %name, "Service '{}' not found, cannot stop", name);
            false
        }
    }

    /// Start a single service by name. All of its dependencies must already be started.
    pub async fn start_one(&self, name: &str) -> Result<()> {
        let (svc, deps) = {
            let guard = self.services.read().await;
            let s = guard.get(name).cloned();
            let d = s.as_ref().map(|s| s.dependencies()).unwrap_or_default();
            (s, d)
        };
        let svc = svc.ok_or_else(|| anyhow::anyhow!("Service not found: {}", name))?;
        let started = self.started.read().await;
        for dep in &deps {
            if !started.contains(dep) {
                anyhow::bail!("Cannot start {}: dependency {} is not started", name, dep);
            }
        }
        drop(started);
        svc.start().await?;
        self.started.write().await.insert(name.to_string());
        info!(service = %name, "Service '{}' started", name);
        Ok(())
    }

    /// Health check for one service.
    pub async fn health_one(&self, name: &str) -> Result<ServiceHealth> {
        let svc = {
            let guard = self.services.read().await;
            guard.get(name).cloned()
        };
        match svc {
            Some(s) => s.health().await,
            None => anyhow::bail!("Service not found: {}", name),
        }
    }

    /// Health check for all registered services. Errors are reported as [HealthStatus::Unhealthy].
    pub async fn health_all(&self) -> HashMap<String, ServiceHealth> {
        let guard = self.services.read().await;
        let names: Vec<String> = guard.keys().cloned().collect();
        drop(guard);
        let mut out = HashMap::new();
        for name in names {
            let svc = {
                let g = self.services.read().await;
                g.get(&name).cloned()
            };
            if let Some(s) = svc {
                let h = match s.health().await {
                    Ok(h) => h,
                    Err(e) => ServiceHealth::unhealthy(e.to_string()),
                };
                out.insert(name, h);
            }
        }
        out
    }

    /// Return whether the given service is currently started (tracked by the manager).
    pub async fn is_started(&self, name: &str) -> bool {
        self.started.read().await.contains(name)
    }

    /// Get a registered service by name for downcast or use in app state.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        let guard = self.services.read().await;
        guard.get(name).cloned()
    }

    /// List all registered service names.
    pub async fn names(&self) -> Vec<String> {
        let guard = self.services.read().await;
        guard.keys().cloned().collect()
    }
}
