//! Provider payload construction from the model's declared input schema.
//!
//! Inputs are filtered to schema fields, defaults applied, values coerced to
//! the declared types, and required fields enforced. Generic `image_input`
//! params are adapted to the provider's per-model field names.

use domain_catalog::{canonicalize_kie_model, FieldSpec, FieldType, ModelCatalog, ModelSpec};
use serde_json::{Map, Value};

use crate::error::{GenerationError, GenerationResult};

fn coerce_value(field_type: FieldType, value: Value) -> Value {
    match field_type {
        FieldType::Number => match &value {
            Value::String(raw) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|n| serde_json::Number::from_f64(n))
                .map(Value::Number)
                .unwrap_or(value),
            _ => value,
        },
        FieldType::Integer => match &value {
            Value::String(raw) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.fract() == 0.0)
                .map(|n| Value::Number((n as i64).into()))
                .unwrap_or(value),
            Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && n.as_i64().is_none() {
                        return Value::Number((f as i64).into());
                    }
                }
                value
            }
            _ => value,
        },
        FieldType::Boolean => match &value {
            Value::String(raw) => match raw.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Value::Bool(true),
                "false" | "0" | "no" => Value::Bool(false),
                _ => value,
            },
            _ => value,
        },
        FieldType::Array => match value {
            Value::String(raw) => Value::Array(vec![Value::String(raw)]),
            other => other,
        },
        FieldType::String => value,
    }
}

fn enum_allows(spec: &FieldSpec, value: &Value) -> bool {
    spec.enum_values.is_empty() || spec.enum_values.contains(value)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn first_image_value(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .find(|item| !item.is_empty())
            .map(str::to_string),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Build the `{model, input}` payload sent to the provider.
pub fn build_provider_payload(
    catalog: &ModelCatalog,
    spec: &ModelSpec,
    params: &Value,
) -> GenerationResult<Value> {
    let empty = Map::new();
    let params = params.as_object().unwrap_or(&empty);

    // Schema fields only; unknown inputs are dropped.
    let mut input = Map::new();
    for (field_name, field_spec) in &spec.schema_properties {
        let value = match params.get(field_name) {
            Some(value) if !value.is_null() => value.clone(),
            _ => match &field_spec.default {
                Some(default) => default.clone(),
                None => continue,
            },
        };
        let coerced = coerce_value(field_spec.field_type, value);
        if !enum_allows(field_spec, &coerced) {
            let shown = match &coerced {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(GenerationError::param_invalid_enum(field_name, &shown));
        }
        input.insert(field_name.clone(), coerced);
    }

    let missing: Vec<String> = spec
        .schema_required
        .iter()
        .filter(|field| input.get(*field).is_none_or(is_blank))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(GenerationError::param_missing(&missing));
    }

    // Generic image params become the provider's per-model field.
    if let Some(target_field) = catalog.image_input_field(&spec.id) {
        if let Some(raw_value) = input.remove("image_input") {
            if let Some(image) = first_image_value(&raw_value) {
                input.insert(target_field.to_string(), Value::String(image));
            }
        }
    }

    Ok(serde_json::json!({
        "model": canonicalize_kie_model(spec.provider_model()),
        "input": Value::Object(input),
    }))
}
