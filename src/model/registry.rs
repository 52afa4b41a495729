use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Builds a model handle from a path or identifier.
///
/// The registry treats `model_path` as opaque and hands it straight to the
/// loader; any error the loader returns reaches the caller unchanged.
pub trait ModelLoader {
    type Model: DetectionModel;

    fn load(&self, model_path: &str) -> Result<Self::Model>;
}

/// A loaded model that can run prediction on an image.
pub trait DetectionModel {
    type Output;

    fn predict(&self, img_path: &str) -> Result<Self::Output>;
}

/// Output type produced by the models a loader builds.
pub type Prediction<L> = <<L as ModelLoader>::Model as DetectionModel>::Output;

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub model_path: String,
    pub created_at: DateTime<Utc>,
}

pub struct RegisteredModel<M> {
    info: ModelInfo,
    handle: M,
}

impl<M> RegisteredModel<M> {
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn handle(&self) -> &M {
        &self.handle
    }
}

/// Name-to-model mapping. Each name holds at most one handle, owned by the
/// registry until it is overwritten or the registry is dropped.
pub struct ModelRegistry<L: ModelLoader> {
    loader: L,
    models: HashMap<String, RegisteredModel<L::Model>>,
}

impl<L: ModelLoader> ModelRegistry<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            models: HashMap::new(),
        }
    }

    /// Loads a model from `model_path` and stores it under `name`, returning
    /// `name` unchanged.
    ///
    /// An existing entry with the same name is replaced and its handle
    /// dropped. The load happens first, so a failed load leaves the registry
    /// untouched.
    pub fn create_model(&mut self, name: impl Into<String>, model_path: &str) -> Result<String> {
        let name = name.into();

        tracing::info!("Loading model '{}' from {}", name, model_path);
        let handle = self.loader.load(model_path)?;

        let entry = RegisteredModel {
            info: ModelInfo {
                name: name.clone(),
                model_path: model_path.to_string(),
                created_at: Utc::now(),
            },
            handle,
        };

        if let Some(previous) = self.models.insert(name.clone(), entry) {
            tracing::info!(
                "Replaced model '{}' (was {}, now {})",
                name,
                previous.info.model_path,
                model_path
            );
        }

        Ok(name)
    }

    /// Runs the model registered under `name` on `img_path`.
    ///
    /// Fails with [`Error::ModelNotFound`] before any inference when the name
    /// is unknown. The model's output is returned as-is.
    pub fn predict(&self, name: &str, img_path: &str) -> Result<Prediction<L>> {
        let entry = self.get_model(name)?;

        tracing::debug!("Predicting with '{}' on {}", name, img_path);
        entry.handle.predict(img_path)
    }

    pub fn get_model(&self, name: &str) -> Result<&RegisteredModel<L::Model>> {
        self.models
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn list_models(&self) -> Vec<&ModelInfo> {
        let mut models: Vec<&ModelInfo> = self.models.values().map(|m| &m.info).collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
