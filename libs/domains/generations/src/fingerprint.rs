//! Stable fingerprint of normalized input params, used as the dedupe key
//! component. Object keys are sorted recursively so logically identical
//! payloads hash identically regardless of field order.

use serde_json::Value;
use sha2::{Digest, Sha256};

fn canonicalize(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                canonicalize(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                canonicalize(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// SHA-256 over the canonical form of `(model_id, params)`, truncated to 16
/// hex chars.
pub fn prompt_fingerprint(model_id: &str, params: &Value) -> String {
    let mut canonical = String::new();
    canonicalize(params, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a = json!({"prompt": "cat", "steps": 20});
        let b = json!({"steps": 20, "prompt": "cat"});
        assert_eq!(prompt_fingerprint("m", &a), prompt_fingerprint("m", &b));
    }

    #[test]
    fn test_nested_objects_canonicalized() {
        let a = json!({"outer": {"b": 1, "a": 2}});
        let b = json!({"outer": {"a": 2, "b": 1}});
        assert_eq!(prompt_fingerprint("m", &a), prompt_fingerprint("m", &b));
    }

    #[test]
    fn test_different_params_differ() {
        let a = json!({"prompt": "cat"});
        let b = json!({"prompt": "dog"});
        assert_ne!(prompt_fingerprint("m", &a), prompt_fingerprint("m", &b));
    }

    #[test]
    fn test_model_id_is_part_of_the_key() {
        let params = json!({"prompt": "cat"});
        assert_ne!(
            prompt_fingerprint("model-a", &params),
            prompt_fingerprint("model-b", &params)
        );
    }

    #[test]
    fn test_array_order_matters() {
        let a = json!({"urls": ["x", "y"]});
        let b = json!({"urls": ["y", "x"]});
        assert_ne!(prompt_fingerprint("m", &a), prompt_fingerprint("m", &b));
    }

    #[test]
    fn test_fingerprint_shape() {
        let fp = prompt_fingerprint("m", &json!({}));
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
