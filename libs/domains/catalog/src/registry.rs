use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::aliases::canonicalize_model_id;
use crate::spec::ModelSpec;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Catalog entry '{0}' has an empty id")]
    EmptyId(usize),
}

/// Fixed mapping of generic `image_input` params onto the per-model field
/// names the provider expects.
fn image_input_target(model_id: &str) -> Option<&'static str> {
    match model_id {
        "recraft/remove-background" => Some("image"),
        "recraft/crisp-upscale" => Some("image"),
        "ideogram/v3-reframe" => Some("image_url"),
        "topaz/image-upscale" => Some("image_url"),
        _ => None,
    }
}

/// Immutable model registry, loaded once at startup.
pub struct ModelCatalog {
    models: HashMap<String, ModelSpec>,
}

impl ModelCatalog {
    pub fn new(specs: impl IntoIterator<Item = ModelSpec>) -> Self {
        let models = specs
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();
        Self { models }
    }

    /// Load from a JSON array of model specs.
    pub fn from_json(value: Value) -> Result<Self, CatalogError> {
        let specs: Vec<ModelSpec> = serde_json::from_value(value)?;
        for (index, spec) in specs.iter().enumerate() {
            if spec.id.is_empty() {
                return Err(CatalogError::EmptyId(index));
            }
        }
        info!(models = specs.len(), "Model catalog loaded");
        Ok(Self::new(specs))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(serde_json::from_str(&raw)?)
    }

    /// Look up a model, folding id aliases first.
    pub fn get(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models
            .get(canonicalize_model_id(model_id))
            .or_else(|| self.models.get(model_id))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// SKUs eligible for hourly-free consumption: every SKU of a model
    /// marked free.
    pub fn free_sku_allowlist(&self) -> HashSet<String> {
        self.models
            .values()
            .filter(|spec| spec.free)
            .flat_map(|spec| spec.modes.iter().map(|mode| mode.sku_id.clone()))
            .collect()
    }

    /// Per-model rename of the generic `image_input` field, if any.
    pub fn image_input_field(&self, model_id: &str) -> Option<&'static str> {
        image_input_target(canonicalize_model_id(model_id))
    }
}
