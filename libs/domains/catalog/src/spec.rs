use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::media::MediaKind;

/// Declared type of one input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Array,
}

/// Schema entry for one model input field.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FieldSpec {
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(rename = "enum", default)]
    pub enum_values: Vec<Value>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
}

/// One priced variant of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkuMode {
    pub sku_id: String,
    /// Billing unit: image, video, second, 1000_chars, request, ...
    pub unit: String,
    #[serde(default)]
    pub credits: f64,
    /// Price in RUB for one unit
    pub price_rub: Decimal,
}

/// Specification of a catalog model; consumed read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Provider-facing id when it differs from `id`
    #[serde(default)]
    pub kie_model: String,
    #[serde(default)]
    pub model_mode: String,
    #[serde(default)]
    pub output_media_type: MediaKind,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub schema_required: Vec<String>,
    #[serde(default)]
    pub schema_properties: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub modes: Vec<SkuMode>,
}

impl ModelSpec {
    /// The provider-facing model id, defaulting to the catalog id.
    pub fn provider_model(&self) -> &str {
        if self.kie_model.is_empty() {
            &self.id
        } else {
            &self.kie_model
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Price of one SKU of this model, if it exists.
    pub fn price_for_sku(&self, sku_id: &str) -> Option<Decimal> {
        self.modes
            .iter()
            .find(|mode| mode.sku_id == sku_id)
            .map(|mode| mode.price_rub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_from_json(value: Value) -> ModelSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_minimal_spec_deserializes() {
        let spec = spec_from_json(json!({
            "id": "flux-2/pro-text-to-image",
            "output_media_type": "image",
        }));
        assert_eq!(spec.provider_model(), "flux-2/pro-text-to-image");
        assert_eq!(spec.display_name(), "flux-2/pro-text-to-image");
        assert_eq!(spec.output_media_type, MediaKind::Image);
        assert!(!spec.free);
    }

    #[test]
    fn test_kie_model_override() {
        let spec = spec_from_json(json!({
            "id": "sora-2/t2v",
            "kie_model": "sora-2-text-to-video",
        }));
        assert_eq!(spec.provider_model(), "sora-2-text-to-video");
    }

    #[test]
    fn test_schema_fields_parse() {
        let spec = spec_from_json(json!({
            "id": "m",
            "schema_required": ["prompt"],
            "schema_properties": {
                "prompt": {"type": "string"},
                "steps": {"type": "integer", "default": 20, "minimum": 1.0, "maximum": 50.0},
                "style": {"type": "string", "enum": ["vivid", "natural"]},
            },
        }));
        assert_eq!(spec.schema_required, vec!["prompt"]);
        let steps = &spec.schema_properties["steps"];
        assert_eq!(steps.field_type, FieldType::Integer);
        assert_eq!(steps.default, Some(json!(20)));
        assert_eq!(spec.schema_properties["style"].enum_values.len(), 2);
    }

    #[test]
    fn test_price_for_sku() {
        let spec = spec_from_json(json!({
            "id": "m",
            "modes": [
                {"sku_id": "m:hd", "unit": "image", "price_rub": "12.50"},
                {"sku_id": "m:sd", "unit": "image", "price_rub": "5.00"},
            ],
        }));
        assert_eq!(spec.price_for_sku("m:sd").unwrap().to_string(), "5.00");
        assert!(spec.price_for_sku("m:4k").is_none());
    }
}
