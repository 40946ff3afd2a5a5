use std::collections::HashSet;

use crate::{env_optional, ConfigError, FromEnv};

/// Admin user ids exempt from billing.
///
/// `ADMIN_IDS` takes a comma- or space-separated list; `ADMIN_ID` adds a
/// single id. Unparseable entries are skipped.
#[derive(Clone, Debug, Default)]
pub struct AdminConfig {
    ids: HashSet<i64>,
}

impl AdminConfig {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.ids.contains(&user_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromEnv for AdminConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mut ids = HashSet::new();
        if let Some(raw) = env_optional("ADMIN_IDS") {
            for token in raw.split([',', ' ']) {
                if let Ok(id) = token.trim().parse::<i64>() {
                    ids.insert(id);
                }
            }
        }
        if let Some(raw) = env_optional("ADMIN_ID") {
            if let Ok(id) = raw.trim().parse::<i64>() {
                ids.insert(id);
            }
        }
        Ok(Self { ids })
    }
}
