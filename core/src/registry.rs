//! Model registry
//!
//! Durable mapping of model id to backend configuration. The whole collection
//! lives under a single store key and every mutation rewrites it in one `set`,
//! so a failed write leaves the previous collection untouched.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::RegistryError;
use crate::store::KeyValueStore;

const MODELS_KEY: &str = "models";

/// A backend model exposed under a local alias.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub alias: String,
    /// Backend base URL, without trailing slash.
    pub url: String,
    /// Model name substituted into outgoing request bodies.
    pub real_model: String,
    #[serde(rename = "default", default)]
    pub is_default: bool,
}

/// On-disk shape. Older records were keyed by alias and may lack `id`/`default`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredModel {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    alias: Option<String>,
    url: String,
    real_model: String,
    #[serde(default)]
    default: bool,
}

/// Validated, normalized user input for add/update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInput {
    pub alias: String,
    pub url: String,
    pub real_model: String,
}

impl ModelInput {
    pub fn new(alias: &str, url: &str, real_model: &str) -> Result<Self, RegistryError> {
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(RegistryError::Validation("alias is required".to_string()));
        }

        let real_model = real_model.trim();
        if real_model.is_empty() {
            return Err(RegistryError::Validation("real model is required".to_string()));
        }

        Ok(Self {
            alias: alias.to_string(),
            url: normalize_url(url)?,
            real_model: real_model.to_string(),
        })
    }
}

/// Trim whitespace and trailing slashes, then require an absolute http(s) URL.
pub fn normalize_url(raw: &str) -> Result<String, RegistryError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(RegistryError::Validation("url is required".to_string()));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| RegistryError::Validation(format!("invalid url '{}': {}", trimmed, e)))?;

    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(RegistryError::Validation(format!(
            "url '{}' must be an absolute http(s) URL",
            trimmed
        )));
    }

    Ok(trimmed.to_string())
}

pub struct ModelRegistry {
    store: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Register a new model and return its id.
    pub fn add(
        &self,
        alias: &str,
        url: &str,
        real_model: &str,
        is_default: bool,
    ) -> Result<String, RegistryError> {
        let input = ModelInput::new(alias, url, real_model)?;

        let _guard = self.lock();
        let (mut models, unreadable) = self.load_all()?;

        if models.values().any(|m| m.alias == input.alias) {
            return Err(RegistryError::Conflict(input.alias));
        }

        let id = uuid::Uuid::new_v4().to_string();
        if is_default {
            clear_default(&mut models);
        }
        models.insert(
            id.clone(),
            Model {
                id: id.clone(),
                alias: input.alias,
                url: input.url,
                real_model: input.real_model,
                is_default,
            },
        );

        self.save(&models, &unreadable)?;
        tracing::info!(id = %id, "Added model");
        Ok(id)
    }

    /// Replace alias/url/real model of `id`. `is_default: None` keeps the current flag.
    pub fn update(
        &self,
        id: &str,
        alias: &str,
        url: &str,
        real_model: &str,
        is_default: Option<bool>,
    ) -> Result<Model, RegistryError> {
        let input = ModelInput::new(alias, url, real_model)?;

        let _guard = self.lock();
        let (mut models, unreadable) = self.load_all()?;

        let current = models
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if models.values().any(|m| m.alias == input.alias && m.id != id) {
            return Err(RegistryError::Conflict(input.alias));
        }

        let is_default = is_default.unwrap_or(current.is_default);
        if is_default {
            clear_default(&mut models);
        }

        let updated = Model {
            id: current.id,
            alias: input.alias,
            url: input.url,
            real_model: input.real_model,
            is_default,
        };
        models.insert(id.to_string(), updated.clone());

        self.save(&models, &unreadable)?;
        tracing::info!(id = %id, alias = %updated.alias, "Updated model");
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Result<Model, RegistryError> {
        let _guard = self.lock();
        let (mut models, unreadable) = self.load_all()?;

        let removed = models
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        self.save(&models, &unreadable)?;
        tracing::info!(id = %id, alias = %removed.alias, "Removed model");
        Ok(removed)
    }

    /// Make `id` the single default model.
    pub fn set_default(&self, id: &str) -> Result<(), RegistryError> {
        let _guard = self.lock();
        let (mut models, unreadable) = self.load_all()?;

        if !models.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }

        clear_default(&mut models);
        if let Some(model) = models.get_mut(id) {
            model.is_default = true;
        }
        self.save(&models, &unreadable)
    }

    pub fn get(&self, id: &str) -> Result<Option<Model>, RegistryError> {
        Ok(self.load()?.remove(id))
    }

    pub fn get_by_alias(&self, alias: &str) -> Result<Option<Model>, RegistryError> {
        Ok(self.load()?.into_values().find(|m| m.alias == alias))
    }

    pub fn default_model(&self) -> Result<Option<Model>, RegistryError> {
        Ok(self.load()?.into_values().find(|m| m.is_default))
    }

    /// All models, ordered by alias.
    pub fn list(&self) -> Result<Vec<Model>, RegistryError> {
        let mut models: Vec<Model> = self.load()?.into_values().collect();
        models.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(models)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<BTreeMap<String, Model>, RegistryError> {
        Ok(self.load_all()?.0)
    }

    /// Readable models keyed by id, plus the raw records that failed to parse.
    /// The latter are written back verbatim so a mutation never drops them.
    fn load_all(&self) -> Result<(BTreeMap<String, Model>, Map<String, Value>), RegistryError> {
        let raw = match self.store.get(MODELS_KEY)? {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => return Ok((BTreeMap::new(), Map::new())),
            Some(other) => {
                return Err(RegistryError::Validation(format!(
                    "stored model collection is not an object: {}",
                    other
                )))
            }
        };

        let mut models = BTreeMap::new();
        let mut unreadable = Map::new();
        for (key, value) in raw {
            let stored: StoredModel = match serde_json::from_value(value.clone()) {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!("Keeping unreadable model record {} as-is: {}", key, e);
                    unreadable.insert(key, value);
                    continue;
                }
            };

            // Legacy records were keyed by alias and carried no id; the key stays
            // their id so reads are stable until the next write.
            let id = stored.id.filter(|id| !id.is_empty()).unwrap_or_else(|| key.clone());
            let alias = stored.alias.unwrap_or_else(|| key.clone());

            models.insert(
                id.clone(),
                Model {
                    id,
                    alias,
                    url: stored.url,
                    real_model: stored.real_model,
                    is_default: stored.default,
                },
            );
        }

        Ok((models, unreadable))
    }

    fn save(
        &self,
        models: &BTreeMap<String, Model>,
        unreadable: &Map<String, Value>,
    ) -> Result<(), RegistryError> {
        let mut doc = Map::new();
        for (key, raw) in unreadable {
            doc.insert(key.clone(), raw.clone());
        }
        for (id, model) in models {
            let value = serde_json::to_value(model).map_err(crate::error::StoreError::from)?;
            doc.insert(id.clone(), value);
        }
        self.store.set(MODELS_KEY, Value::Object(doc))?;
        Ok(())
    }
}

fn clear_default(models: &mut BTreeMap<String, Model>) {
    for model in models.values_mut() {
        model.is_default = false;
    }
}
