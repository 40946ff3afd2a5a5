//! Canonicalization of model and provider-facing identifiers.
//!
//! Vendors keep renaming model slugs; the alias table folds the historical
//! spellings into one canonical id before any lookup or provider call.

use std::collections::HashMap;
use std::sync::OnceLock;

fn alias_table() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("sora-2/t2v", "sora-2-text-to-video"),
            ("openai/sora-2-text-to-video", "sora-2-text-to-video"),
            ("sora-2/i2v", "sora-2-image-to-video"),
            ("openai/sora-2-image-to-video", "sora-2-image-to-video"),
            ("sora-2-pro/t2v", "sora-2-pro-text-to-video"),
            ("openai/sora-2-pro-text-to-video", "sora-2-pro-text-to-video"),
            ("sora-2-pro/i2v", "sora-2-pro-image-to-video"),
            ("openai/sora-2-pro-image-to-video", "sora-2-pro-image-to-video"),
            ("sora-2-watermark-remover", "sora-watermark-remover"),
            ("openai/sora-2-watermark-remover", "sora-watermark-remover"),
            ("openai/sora-watermark-remover", "sora-watermark-remover"),
        ])
    })
}

pub fn canonicalize_model_id(model_id: &str) -> &str {
    if model_id.is_empty() {
        return "";
    }
    alias_table().get(model_id).copied().unwrap_or(model_id)
}

pub fn canonicalize_kie_model(kie_model: &str) -> &str {
    canonicalize_model_id(kie_model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_resolution() {
        assert_eq!(canonicalize_model_id("sora-2/t2v"), "sora-2-text-to-video");
        assert_eq!(
            canonicalize_kie_model("openai/sora-watermark-remover"),
            "sora-watermark-remover"
        );
    }

    #[test]
    fn test_unknown_ids_pass_through() {
        assert_eq!(canonicalize_model_id("flux-2/pro-text-to-image"), "flux-2/pro-text-to-image");
        assert_eq!(canonicalize_model_id(""), "");
    }

    #[test]
    fn test_no_alias_points_to_itself() {
        for (alias, canonical) in alias_table().iter() {
            assert_ne!(alias, canonical, "alias '{alias}' points to itself");
        }
    }
}
