//! Store configuration
//!
//! Both store flavours are configured through plain serde structs with
//! defaults for every field. A [`StoreConfig`] can be layered from a TOML file
//! and `HASHSTORE_*` environment variables:
//!
//! ```text
//! HASHSTORE_PAGE_SIZE=65536
//! HASHSTORE_CACHE_PAGES=128
//! HASHSTORE_RETRY__MAX_ATTEMPTS=8
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default page size for file-backed stores
pub const DEFAULT_FILE_PAGE_SIZE: usize = 32 * 1024;

/// Default page size for in-memory tables
pub const DEFAULT_TABLE_PAGE_SIZE: usize = 8 * 1024;

/// Smallest page size accepted by either store
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest page size accepted by either store
pub const MAX_PAGE_SIZE: usize = 1024 * 1024;

/// Configuration of a file-backed [`HashFile`](crate::HashFile)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Size of every page in the page file (bytes)
    pub page_size: usize,
    /// Number of pages held by the page cache
    pub cache_pages: usize,
    /// Seal pages with a CRC-32 trailer and verify it on load
    pub checksums: bool,
    /// Dirty pages written back per `tick()` call
    pub tick_flush_pages: usize,
    /// Fixed seed for probe constant shuffling (random when unset)
    pub probe_seed: Option<u64>,
    /// Physical write retry policy
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_FILE_PAGE_SIZE,
            cache_pages: 32,
            checksums: true,
            tick_flush_pages: 2,
            probe_seed: None,
            retry: RetryConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("HASHSTORE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as a TOML document
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.cache_pages == 0 {
            return Err(Error::Config("cache_pages must be at least 1".to_string()));
        }
        self.retry.validate()
    }
}

/// Configuration of an in-memory [`HashTable`](crate::HashTable)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub page_size: usize,
    pub probe_seed: Option<u64>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_TABLE_PAGE_SIZE,
            probe_seed: None,
        }
    }
}

impl TableConfig {
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)
    }
}

/// Bounded retry with exponential backoff for physical writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before the failure escalates
    pub max_attempts: u32,
    /// Sleep before the first retry (milliseconds)
    pub initial_backoff_ms: u64,
    /// Upper bound for a single sleep (milliseconds)
    pub max_backoff_ms: u64,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Sleep to take after `attempt` failed attempts (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let ms = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

fn validate_page_size(page_size: usize) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || page_size % 4 != 0 {
        return Err(Error::Config(format!(
            "page_size must be a multiple of 4 between {} and {}, got {}",
            MIN_PAGE_SIZE, MAX_PAGE_SIZE, page_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(StoreConfig::default().validate().is_ok());
        assert!(TableConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() -> Result<()> {
        let config = StoreConfig::from_toml("page_size = 4096\n[retry]\nmax_attempts = 2\n")?;
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.cache_pages, 32);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 10);
        Ok(())
    }

    #[test]
    fn test_toml_round_trip() -> Result<()> {
        let mut config = StoreConfig::default();
        config.probe_seed = Some(7);
        let text = config.to_toml()?;
        assert_eq!(StoreConfig::from_toml(&text)?, config);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_page_size() {
        assert!(StoreConfig::from_toml("page_size = 1000").is_err());
        assert!(StoreConfig::from_toml("page_size = 1026").is_err());
        assert!(StoreConfig::from_toml("cache_pages = 0").is_err());
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::io("creating tempdir", e))?;
        let path = dir.path().join("hashstore.toml");
        std::fs::write(&path, "page_size = 16384\nchecksums = false\n")
            .map_err(|e| Error::io("writing config", e))?;

        let config = StoreConfig::load(Some(path.as_path()))?;
        assert_eq!(config.page_size, 16384);
        assert!(!config.checksums);
        Ok(())
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(40), Duration::from_millis(1000));
    }
}
