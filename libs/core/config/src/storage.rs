use std::path::PathBuf;

use crate::{env_optional, env_or_default, ConfigError, FromEnv};

/// Persistence backend selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    Json,
    Db,
}

/// Storage façade configuration
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub mode: StorageMode,
    /// Root directory for the JSON backend; tenant subdirectory is appended
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Json,
            data_dir: PathBuf::from("data"),
            database_url: None,
        }
    }
}

impl FromEnv for StorageConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let raw_mode = env_or_default("STORAGE_MODE", "json");
        let mode = match raw_mode.trim().to_lowercase().as_str() {
            "json" => StorageMode::Json,
            "db" | "postgres" => StorageMode::Db,
            other => {
                return Err(ConfigError::ParseError {
                    key: "STORAGE_MODE".to_string(),
                    details: format!("unknown mode '{}' (expected 'json' or 'db')", other),
                })
            }
        };
        let database_url = env_optional("DATABASE_URL");
        if mode == StorageMode::Db && database_url.is_none() {
            return Err(ConfigError::MissingEnvVar("DATABASE_URL".to_string()));
        }
        Ok(Self {
            mode,
            data_dir: PathBuf::from(env_or_default("STORAGE_DATA_DIR", "data")),
            database_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_defaults_to_json() {
        temp_env::with_vars(
            [("STORAGE_MODE", None::<&str>), ("DATABASE_URL", None)],
            || {
                let config = StorageConfig::from_env().unwrap();
                assert_eq!(config.mode, StorageMode::Json);
                assert_eq!(config.data_dir, PathBuf::from("data"));
            },
        );
    }

    #[test]
    fn test_storage_db_requires_url() {
        temp_env::with_vars(
            [("STORAGE_MODE", Some("db")), ("DATABASE_URL", None)],
            || {
                assert!(StorageConfig::from_env().is_err());
            },
        );

        temp_env::with_vars(
            [
                ("STORAGE_MODE", Some("db")),
                ("DATABASE_URL", Some("postgres://localhost/orchestrator")),
            ],
            || {
                let config = StorageConfig::from_env().unwrap();
                assert_eq!(config.mode, StorageMode::Db);
                assert!(config.database_url.is_some());
            },
        );
    }

    #[test]
    fn test_storage_unknown_mode() {
        temp_env::with_var("STORAGE_MODE", Some("s3"), || {
            assert!(StorageConfig::from_env().is_err());
        });
    }
}
