//! Configuration management
//!
//! Every tunable of the pipeline comes from the environment (optionally a
//! `.env` file); nothing below the CLI hard-codes endpoints, limits or paths.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Defaults
// ============================================================================

/// Default endpoint for the first page of a run.
pub const DEFAULT_BASE_URL: &str = "https://clinicaltrials.gov/api/v2/studies";

/// Placeholder substituted with the continuation token in the pages template.
pub const TOKEN_PLACEHOLDER: &str = "{token}";

/// Default JSON field holding the page's records.
pub const DEFAULT_RECORDS_FIELD: &str = "studies";

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default attempts per page before the run fails.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between attempts, doubled on every retry.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Default request cap per rate-limit window.
pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: usize = 50;

/// Default rate-limit window in seconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Default number of pages to extract per run.
pub const DEFAULT_TARGET_PAGES: u32 = 100;

pub const DEFAULT_SHARD_DIR: &str = "./data/shards";
pub const DEFAULT_COMPACT_DIR: &str = "./data/compacted";
pub const DEFAULT_STATE_FILE: &str = "./data/state/cursor.json";
pub const DEFAULT_OUTPUT_DIR: &str = "./data/tables";

/// Top-level ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub api: ApiConfig,
    pub rate_limit: RateLimitConfig,
    pub storage: StorageConfig,
    /// Pages to have on disk before a run is considered complete
    pub target_pages: u32,
    /// Directory for the JSON-lines table loader
    pub output_dir: PathBuf,
    /// PostgreSQL connection string for the database loader
    pub database_url: Option<String>,
}

/// Upstream API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Endpoint for the first page of a run
    pub base_url: String,
    /// Endpoint for later pages; `{token}` is replaced by the continuation
    /// token, or the token is appended when the placeholder is absent
    pub pages_url_template: String,
    /// Response field holding the list of records
    pub records_field: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Treat a response without `nextPageToken` as the end of the dataset
    /// instead of a failure
    pub end_on_missing_token: bool,
}

/// Outbound request budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_secs: u64,
}

/// Local storage roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub shard_root: PathBuf,
    pub compact_root: PathBuf,
    pub state_file: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            pages_url_template: default_pages_template(DEFAULT_BASE_URL),
            records_field: DEFAULT_RECORDS_FIELD.to_string(),
            timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            end_on_missing_token: false,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shard_root: PathBuf::from(DEFAULT_SHARD_DIR),
            compact_root: PathBuf::from(DEFAULT_COMPACT_DIR),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            rate_limit: RateLimitConfig::default(),
            storage: StorageConfig::default(),
            target_pages: DEFAULT_TARGET_PAGES,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            database_url: None,
        }
    }
}

impl ApiConfig {
    /// URL for the page following `token`
    pub fn page_url(&self, token: &str) -> String {
        if self.pages_url_template.contains(TOKEN_PLACEHOLDER) {
            self.pages_url_template.replace(TOKEN_PLACEHOLDER, token)
        } else {
            format!("{}{}", self.pages_url_template, token)
        }
    }
}

fn default_pages_template(base_url: &str) -> String {
    format!("{}?pageToken={}", base_url, TOKEN_PLACEHOLDER)
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IngestError::Config(format!("{} has an invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

impl IngestConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(url) = std::env::var("CTP_BASE_URL") {
            config.api.pages_url_template = default_pages_template(&url);
            config.api.base_url = url;
        }
        if let Ok(template) = std::env::var("CTP_PAGES_URL_TEMPLATE") {
            config.api.pages_url_template = template;
        }
        if let Ok(field) = std::env::var("CTP_RECORDS_FIELD") {
            config.api.records_field = field;
        }
        if let Some(secs) = env_parse("CTP_REQUEST_TIMEOUT_SECS")? {
            config.api.timeout_secs = secs;
        }
        if let Some(retries) = env_parse("CTP_MAX_RETRIES")? {
            config.api.max_retries = retries;
        }
        if let Some(ms) = env_parse("CTP_RETRY_BACKOFF_MS")? {
            config.api.retry_backoff_ms = ms;
        }
        if let Some(flag) = env_parse("CTP_END_ON_MISSING_TOKEN")? {
            config.api.end_on_missing_token = flag;
        }
        if let Some(max) = env_parse("CTP_RATE_LIMIT_MAX_REQUESTS")? {
            config.rate_limit.max_requests = max;
        }
        if let Some(secs) = env_parse("CTP_RATE_LIMIT_WINDOW_SECS")? {
            config.rate_limit.window_secs = secs;
        }
        if let Some(pages) = env_parse("CTP_TARGET_PAGES")? {
            config.target_pages = pages;
        }
        if let Ok(dir) = std::env::var("CTP_SHARD_DIR") {
            config.storage.shard_root = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("CTP_COMPACT_DIR") {
            config.storage.compact_root = PathBuf::from(dir);
        }
        if let Ok(file) = std::env::var("CTP_STATE_FILE") {
            config.storage.state_file = PathBuf::from(file);
        }
        if let Ok(dir) = std::env::var("CTP_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        config.database_url = std::env::var("DATABASE_URL").ok();

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(IngestError::Config("Base URL cannot be empty".to_string()));
        }

        if self.api.pages_url_template.trim().is_empty() {
            return Err(IngestError::Config("Pages URL template cannot be empty".to_string()));
        }

        if self.api.records_field.is_empty() {
            return Err(IngestError::Config("Records field cannot be empty".to_string()));
        }

        if self.api.timeout_secs == 0 {
            return Err(IngestError::Config("Request timeout must be greater than 0".to_string()));
        }

        if self.api.max_retries == 0 {
            return Err(IngestError::Config("Max retries must be at least 1".to_string()));
        }

        if self.rate_limit.max_requests == 0 {
            return Err(IngestError::Config(
                "Rate limit max requests must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit.window_secs == 0 {
            return Err(IngestError::Config(
                "Rate limit window must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.api.max_retries, 3);
        assert_eq!(config.rate_limit.max_requests, 50);
        assert_eq!(config.rate_limit.window_secs, 60);
    }

    #[test]
    fn test_page_url_substitutes_placeholder() {
        let api = ApiConfig::default();
        assert_eq!(
            api.page_url("abc123"),
            "https://clinicaltrials.gov/api/v2/studies?pageToken=abc123"
        );
    }

    #[test]
    fn test_page_url_appends_without_placeholder() {
        let api = ApiConfig {
            pages_url_template: "http://api.local/studies?pageToken=".to_string(),
            ..ApiConfig::default()
        };
        assert_eq!(api.page_url("xyz"), "http://api.local/studies?pageToken=xyz");
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let mut config = IngestConfig::default();
        config.api.max_retries = 0;
        assert!(matches!(config.validate(), Err(IngestError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = IngestConfig::default();
        config.rate_limit.window_secs = 0;
        assert!(config.validate().is_err());
    }
}
