use crate::env_optional;

/// Deployment tenant identity used to partition storage and lock keys.
///
/// Drawn from `BOT_INSTANCE_ID`, then `PARTNER_ID`, else `default`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantId(String);

impl TenantId {
    pub fn from_env() -> Self {
        let id = env_optional("BOT_INSTANCE_ID")
            .or_else(|| env_optional("PARTNER_ID"))
            .unwrap_or_else(|| "default".to_string());
        Self(id)
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix a raw key with the tenant scope: `tenant:<id>:<key>`
    pub fn scoped_key(&self, raw_key: &str) -> String {
        format!("tenant:{}:{}", self.0, raw_key)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
