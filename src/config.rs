use serde::Deserialize;
use std::collections::HashMap;

/// Where settlements, payments and audit records are kept
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Postgres => "postgres",
            StorageBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub bind_address: String,
    pub storage_backend: StorageBackend,
    pub db_max_connections: u32,
    /// Comma-separated list; unset or empty allows any origin
    pub cors_allowed_origins: Option<String>,
    /// JSON array of sales loaded into the memory backend at startup
    pub seed_sales_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Build from the given variables, or the process environment when `None`
    pub fn load(env: Option<HashMap<String, String>>) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("storage_backend", "postgres")?
            .set_default("db_max_connections", 20)?
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.storage_backend == StorageBackend::Postgres && self.database_url().is_none() {
            return Err(config::ConfigError::Message(
                "DATABASE_URL must be set when STORAGE_BACKEND is postgres".to_string(),
            ));
        }
        if self.db_max_connections == 0 {
            return Err(config::ConfigError::Message(
                "DB_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_url(&self) -> Option<&str> {
        self.database_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_with_database_url() {
        let config = Config::load(env(&[("DATABASE_URL", "postgres://localhost/settlements")])).unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.storage_backend, StorageBackend::Postgres);
        assert_eq!(config.db_max_connections, 20);
        assert!(config.cors_origins().is_empty());
    }

    #[test]
    fn test_postgres_requires_database_url() {
        assert!(Config::load(env(&[])).is_err());
    }

    #[test]
    fn test_memory_backend_and_overrides() {
        let config = Config::load(env(&[
            ("STORAGE_BACKEND", "memory"),
            ("BIND_ADDRESS", "127.0.0.1:9000"),
            ("DB_MAX_CONNECTIONS", "5"),
            ("CORS_ALLOWED_ORIGINS", "http://localhost:3000, https://ops.example.com"),
        ]))
        .unwrap();

        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.db_max_connections, 5);
        assert_eq!(
            config.cors_origins(),
            vec!["http://localhost:3000", "https://ops.example.com"]
        );
        assert!(config.database_url().is_none());
    }
}
