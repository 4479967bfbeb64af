//! Proxy router
//!
//! Owns the table of live listeners, keyed by alias. The table starts empty,
//! is only touched through this type, and is emptied by [`ProxyRouter::stop_all`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::RouterError;
use crate::proxy::ports::PortAllocator;
use crate::proxy::server::{ListenerState, ReverseProxyServer};
use crate::proxy::upstream::UpstreamClient;
use crate::registry::ModelRegistry;

/// Where a running alias can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEndpoint {
    pub port: u16,
    pub local_url: String,
}

/// Live listener for one alias.
struct RuntimeServerEntry {
    model_id: String,
    endpoint: ProxyEndpoint,
    server: ReverseProxyServer,
}

pub struct ProxyRouter {
    registry: Arc<ModelRegistry>,
    config: Config,
    ports: PortAllocator,
    client: UpstreamClient,
    entries: Mutex<HashMap<String, RuntimeServerEntry>>,
}

impl ProxyRouter {
    pub fn new(registry: Arc<ModelRegistry>, config: Config) -> Result<Self, RouterError> {
        let client = UpstreamClient::new(&config.timeouts)?;
        let ports = PortAllocator::from_config(&config.server);

        Ok(Self {
            registry,
            config,
            ports,
            client,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve `alias`, bind a listener on the first free port and register it.
    ///
    /// The table lock is held across the bind, so two concurrent starts of the
    /// same alias produce one listener and one `AlreadyRunning`.
    pub async fn start(&self, alias: &str) -> Result<ProxyEndpoint, RouterError> {
        let mut entries = self.entries.lock().await;

        if entries.contains_key(alias) {
            return Err(RouterError::AlreadyRunning(alias.to_string()));
        }

        let model = self
            .registry
            .get_by_alias(alias)?
            .ok_or_else(|| RouterError::ModelNotFound(alias.to_string()))?;

        let host = &self.config.server.host;
        let mut candidate = self.config.server.base_port;

        let server = loop {
            let port = self.ports.find_free(candidate)?;

            match ReverseProxyServer::bind(
                host,
                port,
                model.clone(),
                self.client.clone(),
                self.config.proxy.max_body_bytes,
            )
            .await
            {
                Ok(server) => break server,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    tracing::debug!(port = port, "Port taken between probe and bind, retrying");
                    if port >= self.ports.last_port() {
                        return Err(RouterError::NoFreePort {
                            start: self.config.server.base_port,
                            end: self.ports.last_port(),
                        });
                    }
                    candidate = port + 1;
                }
                Err(e) => {
                    return Err(RouterError::Bind {
                        addr: format!("{}:{}", host, port),
                        source: e,
                    })
                }
            }
        };

        let endpoint = ProxyEndpoint {
            port: server.port(),
            local_url: format!("http://{}:{}/v1", host, server.port()),
        };

        tracing::info!(
            alias = %alias,
            port = endpoint.port,
            real_model = %model.real_model,
            "Proxy started at {}",
            endpoint.local_url
        );

        entries.insert(
            alias.to_string(),
            RuntimeServerEntry {
                model_id: model.id,
                endpoint: endpoint.clone(),
                server,
            },
        );

        Ok(endpoint)
    }

    /// Close the listener for `alias` and forget it.
    ///
    /// With `proxy.strict_stop = false` a missing alias is a no-op instead of `NotRunning`.
    ///
    /// The entry leaves the table before draining starts, so a slow drain never
    /// blocks lookups or starts of other aliases.
    pub async fn stop(&self, alias: &str) -> Result<(), RouterError> {
        let removed = self.entries.lock().await.remove(alias);

        let Some(entry) = removed else {
            if self.config.proxy.strict_stop {
                return Err(RouterError::NotRunning(alias.to_string()));
            }
            return Ok(());
        };

        entry.server.shutdown(self.config.proxy.drain_timeout()).await;
        tracing::info!(alias = %alias, port = entry.endpoint.port, "Proxy stopped");
        Ok(())
    }

    /// Stop every live listener. Called once when the hosting process shuts down.
    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.entries.lock().await.drain().collect();
        let drain_timeout = self.config.proxy.drain_timeout();

        let shutdowns = drained.into_iter().map(|(alias, entry)| async move {
            entry.server.shutdown(drain_timeout).await;
            tracing::info!(alias = %alias, "Stopped server for model");
        });
        futures::future::join_all(shutdowns).await;
    }

    pub async fn is_running(&self, alias: &str) -> bool {
        self.entries.lock().await.contains_key(alias)
    }

    pub async fn get_endpoint(&self, alias: &str) -> Option<ProxyEndpoint> {
        self.entries
            .lock()
            .await
            .get(alias)
            .map(|entry| entry.endpoint.clone())
    }

    /// Alias currently served for registry id `model_id`, if any.
    pub async fn running_alias_for(&self, model_id: &str) -> Option<String> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|(_, entry)| entry.model_id == model_id)
            .map(|(alias, _)| alias.clone())
    }

    pub async fn listener_state(&self, alias: &str) -> ListenerState {
        self.entries
            .lock()
            .await
            .get(alias)
            .map(|entry| entry.server.state())
            .unwrap_or(ListenerState::Unbound)
    }

    /// Snapshot of every running alias and its endpoint, ordered by alias.
    pub async fn running(&self) -> Vec<(String, ProxyEndpoint)> {
        let mut running: Vec<_> = self
            .entries
            .lock()
            .await
            .iter()
            .map(|(alias, entry)| (alias.clone(), entry.endpoint.clone()))
            .collect();
        running.sort_by(|a, b| a.0.cmp(&b.0));
        running
    }
}
