//! Result URL normalization.
//!
//! Provider outputs arrive in several broken shapes: relative paths,
//! scheme-less `//host/...`, and spliced values like `host.comhttps:///x`
//! where the real URL starts mid-string. Repairs are deterministic and each
//! one is logged with a stable code so provider regressions stay visible.

use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::{GenerationError, GenerationResult};

/// Context for host fallback resolution during normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlContext<'a> {
    /// Configured CDN base for relative results
    pub base_url: Option<&'a str>,
    /// Provider API base, used as a last-resort host
    pub provider_base_url: Option<&'a str>,
    /// Raw provider record; may carry explicit host hints
    pub record: Option<&'a Value>,
    pub correlation_id: Option<&'a str>,
    pub model_id: Option<&'a str>,
}

fn host_of(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = Url::parse(trimmed) {
        if let Some(host) = parsed.host_str() {
            return Some(host.to_string());
        }
    }
    if !trimmed.contains("://") {
        return Some(trimmed.trim_matches('/').to_string());
    }
    None
}

fn fallback_host(ctx: &UrlContext) -> Option<String> {
    if let Some(host) = ctx.base_url.and_then(host_of) {
        return Some(host);
    }
    if let Some(host) = ctx.provider_base_url.and_then(host_of) {
        return Some(host);
    }
    let record = ctx.record?;
    for key in [
        "baseUrl",
        "base_url",
        "cdnBaseUrl",
        "cdn_base_url",
        "resultBaseUrl",
        "result_base_url",
        "host",
        "hostname",
        "domain",
    ] {
        if let Some(host) = record.get(key).and_then(Value::as_str).and_then(host_of) {
            return Some(host);
        }
    }
    None
}

/// A URL usable for delivery: absolute http(s) with a host.
pub fn is_valid_result_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
        }
        Err(_) => false,
    }
}

fn invalid(ctx: &UrlContext, raw: &str, hint: &str) -> GenerationError {
    warn!(
        action = "URL_NORMALIZE",
        correlation_id = ctx.correlation_id.unwrap_or("corr-na-na"),
        model_id = ctx.model_id.unwrap_or("-"),
        raw_url = %raw,
        error_code = "INVALID_RESULT_URL",
        fix_hint = %hint,
        "result URL failed normalization"
    );
    GenerationError::ResultParse {
        code: "KIE_RESULT_URL_INVALID",
        fix_hint: hint.to_string(),
    }
}

/// Normalize one result URL. Idempotent: a normalized URL passes through
/// unchanged.
pub fn normalize_result_url(raw_url: &str, ctx: &UrlContext) -> GenerationResult<String> {
    let mut raw = raw_url.trim().to_string();

    // Spliced values: keep everything from the first embedded protocol.
    let protocol_index = ["http://", "https://"]
        .iter()
        .filter_map(|scheme| raw.find(scheme))
        .min();
    if let Some(index) = protocol_index {
        if index > 0 {
            observability::record_url_repair("URL_SPLICE_PREFIX");
            debug!(
                action = "URL_NORMALIZE",
                repair = "URL_SPLICE_PREFIX",
                raw_url = %raw,
                "dropped junk before embedded protocol"
            );
            raw = raw[index..].to_string();
        }
    }

    let base = ctx.base_url.map(|b| b.trim_end_matches('/'));
    let mut normalized = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.clone()
    } else if let Some(rest) = raw.strip_prefix("//") {
        observability::record_url_repair("URL_SCHEME_DEFAULTED");
        format!("https://{rest}")
    } else if raw.starts_with('/') {
        let Some(base) = base else {
            return Err(invalid(
                ctx,
                &raw,
                "Relative URL requires base domain configuration",
            ));
        };
        observability::record_url_repair("URL_BASE_PREPENDED");
        format!("{base}{raw}")
    } else {
        raw.clone()
    };

    // Scheme present but host empty: reattach the fallback host.
    for scheme in ["https://", "http://"] {
        let rest = match normalized.strip_prefix(scheme) {
            Some(rest) => rest.to_string(),
            None => continue,
        };
        if rest.starts_with('/') || rest.is_empty() {
            if let Some(host) = fallback_host(ctx) {
                observability::record_url_repair("URL_HOST_REATTACHED");
                debug!(
                    action = "URL_NORMALIZE",
                    repair = "URL_HOST_REATTACHED",
                    host = %host,
                    "reattached fallback host to empty-host URL"
                );
                let path = if rest.is_empty() { "/" } else { rest.as_str() };
                normalized = format!("{scheme}{host}{path}");
            }
        }
    }

    if !is_valid_result_url(&normalized) {
        return Err(invalid(ctx, raw_url, "check_kie_response_url_fields"));
    }
    debug!(
        action = "URL_NORMALIZE",
        correlation_id = ctx.correlation_id.unwrap_or("corr-na-na"),
        raw_url = %raw_url,
        normalized_url = %normalized,
        "result URL normalized"
    );
    Ok(normalized)
}

/// Normalize a batch, skipping empty entries.
pub fn normalize_result_urls(
    urls: &[String],
    ctx: &UrlContext,
) -> GenerationResult<Vec<String>> {
    let mut normalized = Vec::with_capacity(urls.len());
    for raw in urls {
        if raw.is_empty() {
            continue;
        }
        normalized.push(normalize_result_url(raw, ctx)?);
    }
    Ok(normalized)
}
