//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (gateway credentials) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::catalogue::DEFAULT_MATCHES_FILE;
use crate::gateway::{DEFAULT_REFRESH_MARGIN_SECS, DEFAULT_TOKEN_TTL_SECS};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub catalogue: CatalogueConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CatalogueConfig {
    pub matches_path: String,
}

impl Default for CatalogueConfig {
    fn default() -> Self {
        Self { matches_path: DEFAULT_MATCHES_FILE.to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub base_url: String,
    pub client_id_env: String,
    pub client_secret_env: String,
    pub token_ttl_secs: i64,
    pub refresh_margin_secs: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: crate::gateway::ezipay::DEFAULT_BASE_URL.to_string(),
            client_id_env: "EZIPAY_CLIENT_ID".to_string(),
            client_secret_env: "EZIPAY_CLIENT_SECRET".to_string(),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config() {
        // Needs config.toml in the working directory; skipped otherwise.
        let result = AppConfig::load("config.toml");
        if let Ok(cfg) = result {
            assert!(cfg.server.port > 0);
            assert!(cfg.storage.database_url.starts_with("sqlite:"));
            assert_eq!(cfg.catalogue.matches_path, "matches.json");
            assert!(cfg.gateway.refresh_margin_secs < cfg.gateway.token_ttl_secs);
        }
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            [server]
            port = 8080

            [storage]
            database_url = "sqlite::memory:"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.storage.max_connections, 5);
        assert_eq!(cfg.catalogue.matches_path, DEFAULT_MATCHES_FILE);
        assert!(!cfg.gateway.enabled);
        assert_eq!(cfg.gateway.token_ttl_secs, 7200);
        assert_eq!(cfg.gateway.refresh_margin_secs, 60);
    }

    #[test]
    fn test_missing_section_is_error() {
        assert!(AppConfig::from_toml("[server]\nport = 1").is_err());
    }

    #[test]
    fn test_resolve_env_missing() {
        assert!(AppConfig::resolve_env("CHANPYON_SURELY_UNSET_VARIABLE").is_err());
    }
}
