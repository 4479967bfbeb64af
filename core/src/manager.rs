//! Control surface consumed by the CLI (or any other front end).
//!
//! Sequences registry mutations against proxy lifecycle: a running proxy is
//! always stopped before the record it serves is changed or deleted, and no
//! start can slip in between that stop and the commit.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{ManagerError, RegistryError};
use crate::proxy::router::{ProxyEndpoint, ProxyRouter};
use crate::registry::{Model, ModelInput, ModelRegistry};
use crate::store::KeyValueStore;

/// A model plus its live endpoint, if any.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    #[serde(flatten)]
    pub model: Model,
    pub endpoint: Option<ProxyEndpoint>,
}

/// Outcome of `update_model`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub model: Model,
    /// Set when the alias was running and has been restarted with the new settings.
    pub restarted: Option<ProxyEndpoint>,
}

pub struct ProxyManager {
    registry: Arc<ModelRegistry>,
    router: ProxyRouter,
    /// Held by every start and by update/remove from stop through commit.
    lifecycle: Mutex<()>,
}

impl ProxyManager {
    pub fn new(store: Arc<dyn KeyValueStore>, config: Config) -> Result<Self, ManagerError> {
        let registry = Arc::new(ModelRegistry::new(store));
        let router = ProxyRouter::new(registry.clone(), config)?;
        Ok(Self {
            registry,
            router,
            lifecycle: Mutex::new(()),
        })
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn router(&self) -> &ProxyRouter {
        &self.router
    }

    pub fn add_model(
        &self,
        alias: &str,
        url: &str,
        real_model: &str,
        is_default: bool,
    ) -> Result<String, ManagerError> {
        Ok(self.registry.add(alias, url, real_model, is_default)?)
    }

    /// Update a model. If its alias is running, the listener is stopped before
    /// the new record is committed and restarted under the new alias afterwards.
    pub async fn update_model(
        &self,
        id: &str,
        alias: &str,
        url: &str,
        real_model: &str,
        is_default: Option<bool>,
    ) -> Result<UpdateOutcome, ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;

        // Reject bad input and unknown/conflicting records before touching a live listener.
        let input = ModelInput::new(alias, url, real_model)?;
        let current = self
            .registry
            .get(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if let Some(owner) = self.registry.get_by_alias(&input.alias)? {
            if owner.id != id {
                return Err(RegistryError::Conflict(input.alias).into());
            }
        }

        let was_running = self.router.running_alias_for(&current.id).await;
        if let Some(running) = &was_running {
            tracing::info!(alias = %running, "Stopping proxy before update");
            self.router.stop(running).await?;
        }

        let model = self
            .registry
            .update(id, &input.alias, &input.url, &input.real_model, is_default)?;

        let restarted = match was_running {
            Some(_) => Some(self.router.start(&model.alias).await?),
            None => None,
        };

        Ok(UpdateOutcome { model, restarted })
    }

    /// Remove a model, stopping its proxy first if it is running.
    pub async fn remove_model(&self, id: &str) -> Result<Model, ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self
            .registry
            .get(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if let Some(running) = self.router.running_alias_for(&current.id).await {
            tracing::info!(alias = %running, "Stopping proxy before removal");
            self.router.stop(&running).await?;
        }

        Ok(self.registry.remove(id)?)
    }

    pub fn set_default(&self, id: &str) -> Result<(), ManagerError> {
        Ok(self.registry.set_default(id)?)
    }

    pub fn get_models(&self) -> Result<Vec<Model>, ManagerError> {
        Ok(self.registry.list()?)
    }

    /// Every model with its running endpoint.
    pub async fn model_statuses(&self) -> Result<Vec<ModelStatus>, ManagerError> {
        let mut statuses = Vec::new();
        for model in self.registry.list()? {
            let endpoint = self.router.get_endpoint(&model.alias).await;
            statuses.push(ModelStatus { model, endpoint });
        }
        Ok(statuses)
    }

    pub async fn start_proxy(&self, alias: &str) -> Result<ProxyEndpoint, ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;
        Ok(self.router.start(alias).await?)
    }

    /// Start the default model's proxy, if a default is set.
    pub async fn start_default(&self) -> Result<Option<(String, ProxyEndpoint)>, ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(model) = self.registry.default_model()? else {
            return Ok(None);
        };
        let endpoint = self.router.start(&model.alias).await?;
        Ok(Some((model.alias, endpoint)))
    }

    pub async fn stop_proxy(&self, alias: &str) -> Result<(), ManagerError> {
        Ok(self.router.stop(alias).await?)
    }

    pub async fn is_proxy_running(&self, alias: &str) -> bool {
        self.router.is_running(alias).await
    }

    pub async fn get_proxy_port(&self, alias: &str) -> Option<u16> {
        self.router.get_endpoint(alias).await.map(|e| e.port)
    }

    pub async fn get_proxy_endpoint(&self, alias: &str) -> Option<ProxyEndpoint> {
        self.router.get_endpoint(alias).await
    }

    /// Process teardown: close every listener.
    pub async fn shutdown(&self) {
        self.router.stop_all().await;
    }
}
