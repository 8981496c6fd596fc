//! Catalog configuration.
//!
//! Strongly-typed configuration loading using Figment. Configuration is
//! loaded from (in order of precedence):
//! 1. Environment variables prefixed with `DAQ_CATALOG_`
//! 2. TOML configuration file (default: `config/catalog.toml`)
//!
//! # Environment Variable Overrides
//!
//! Any configuration value can be overridden via environment variables
//! with the `DAQ_CATALOG_` prefix:
//!
//! ```text
//! DAQ_CATALOG_STORE_URI="mongodb://localhost:27017/metadata"
//! DAQ_CATALOG_CACHE_TTL_PARTIAL=5.0
//! DAQ_CATALOG_CHUNK_BYTE_LIMIT=50000000
//! ```
//!
//! Handlers and transforms are registered programmatically on the catalog
//! builder; they are code, not configuration.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<ConfigError> for crate::error::CatalogError {
    fn from(err: ConfigError) -> Self {
        crate::error::CatalogError::Config(err.to_string())
    }
}

/// Top-level catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// How to reach the document store. Must carry the database name,
    /// e.g. `mongodb://localhost:27017/metadata`.
    pub store_uri: String,
    /// Optional second store for resource/datum documents. Defaults to
    /// `store_uri`; single-database deployments are preferred.
    #[serde(default)]
    pub asset_store_uri: Option<String>,
    /// Seconds to cache a complete run before re-checking the store.
    #[serde(default = "default_cache_ttl_complete")]
    pub cache_ttl_complete: f64,
    /// Seconds to cache a live (partial) run.
    #[serde(default = "default_cache_ttl_partial")]
    pub cache_ttl_partial: f64,
    /// Maximum entries per cache tier.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Byte ceiling for one materialized chunk.
    #[serde(default = "default_chunk_byte_limit")]
    pub chunk_byte_limit: usize,
    /// Leading-axis block size for rank-4 area-detector arrays.
    #[serde(default = "default_ad_frames")]
    pub area_detector_frames_per_chunk: usize,
    /// Remapping of resource roots for moved or remounted files.
    #[serde(default)]
    pub root_map: HashMap<String, String>,
}

impl CatalogConfig {
    /// Load from the default location (`config/catalog.toml`), with
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/catalog.toml")
    }

    /// Load from a custom TOML path, with environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: CatalogConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_CATALOG_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_store_uri(&self.store_uri)?;
        if let Some(asset_uri) = &self.asset_store_uri {
            validate_store_uri(asset_uri)?;
        }
        if self.cache_ttl_complete < 0.0 || self.cache_ttl_partial < 0.0 {
            return Err(ConfigError::Validation(
                "cache TTLs must be non-negative".to_string(),
            ));
        }
        if self.chunk_byte_limit == 0 {
            return Err(ConfigError::Validation(
                "chunk_byte_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The asset store URI, defaulted to the metadata store URI.
    pub fn effective_asset_store_uri(&self) -> &str {
        self.asset_store_uri.as_deref().unwrap_or(&self.store_uri)
    }
}

fn validate_store_uri(uri: &str) -> Result<(), ConfigError> {
    let Some((_, rest)) = uri.split_once("://") else {
        return Err(ConfigError::Validation(format!(
            "invalid store URI {uri:?}: missing scheme"
        )));
    };
    let database = rest.split_once('/').map(|(_, db)| db).unwrap_or("");
    let database = database.split('?').next().unwrap_or("");
    if database.is_empty() {
        return Err(ConfigError::Validation(format!(
            "invalid store URI {uri:?}: did you forget to include a database name?"
        )));
    }
    Ok(())
}

fn default_cache_ttl_complete() -> f64 {
    60.0
}

fn default_cache_ttl_partial() -> f64 {
    2.0
}

fn default_cache_size() -> usize {
    100
}

fn default_chunk_byte_limit() -> usize {
    100_000_000
}

fn default_ad_frames() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> CatalogConfig {
        CatalogConfig {
            store_uri: "mongodb://localhost:27017/metadata".to_string(),
            asset_store_uri: None,
            cache_ttl_complete: default_cache_ttl_complete(),
            cache_ttl_partial: default_cache_ttl_partial(),
            cache_size: default_cache_size(),
            chunk_byte_limit: default_chunk_byte_limit(),
            area_detector_frames_per_chunk: default_ad_frames(),
            root_map: HashMap::new(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(minimal().validate().is_ok());
        assert_eq!(
            minimal().effective_asset_store_uri(),
            "mongodb://localhost:27017/metadata"
        );
    }

    #[test]
    fn test_uri_requires_database_name() {
        let mut config = minimal();
        config.store_uri = "mongodb://localhost:27017".to_string();
        assert!(config.validate().is_err());
        config.store_uri = "mongodb://localhost:27017/".to_string();
        assert!(config.validate().is_err());
        config.store_uri = "mongodb://localhost:27017/db?authSource=admin".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let text = r#"
            store_uri = "mongodb://example:27017/runs"
            cache_ttl_partial = 5.0

            [root_map]
            "/old/mount" = "/new/mount"
        "#;
        let config: CatalogConfig = Figment::new()
            .merge(Toml::string(text))
            .extract()
            .unwrap();
        assert_eq!(config.cache_ttl_partial, 5.0);
        assert_eq!(config.cache_ttl_complete, 60.0);
        assert_eq!(
            config.root_map.get("/old/mount").map(String::as_str),
            Some("/new/mount")
        );
    }
}
