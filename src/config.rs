//! Configuration management for the GA3 backfill job.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::reporting::SamplingLevel;
use crate::warehouse::TableRef;

/// Public Analytics Reporting API endpoint.
const DEFAULT_REPORTING_API_URL: &str = "https://analyticsreporting.googleapis.com";

/// Public BigQuery API endpoint.
const DEFAULT_BIGQUERY_API_URL: &str = "https://bigquery.googleapis.com";

/// The reporting API caps a single page at this many rows.
const MAX_PAGE_SIZE: u32 = 100_000;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Destination table as `project.dataset.table`
    pub destination_table: String,

    /// Analytics view to pull reports from
    pub view_id: String,

    /// Earliest day to backfill (inclusive)
    pub pull_start_date: NaiveDate,

    /// Service-account key file.
    /// Falls back to GOOGLE_APPLICATION_CREDENTIALS when unset.
    pub credentials_file: Option<PathBuf>,

    /// Static bearer token used instead of the service-account exchange
    pub access_token: Option<String>,

    /// Project billed for API quota
    pub quota_project: Option<String>,

    /// Prefix for rewritten landing pages (e.g. "https://www.example.com").
    /// When unset, each row's own hostname is used.
    pub site_base_url: Option<String>,

    /// Goal metric mapped to the `conversions` column
    #[serde(default = "default_goal_metric")]
    pub goal_metric: String,

    /// Rows requested per report page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default)]
    pub sampling_level: SamplingLevel,

    #[serde(default = "default_reporting_api_url")]
    pub reporting_api_url: String,

    #[serde(default = "default_bigquery_api_url")]
    pub bigquery_api_url: String,

    /// BigQuery job location (e.g. "US", "EU")
    pub location: Option<String>,

    /// Enable verbose request logging
    #[serde(default)]
    pub debug: bool,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Buffer before token expiration to refresh (seconds)
    #[serde(default = "default_token_buffer")]
    pub token_refresh_buffer_seconds: u64,
}

fn default_goal_metric() -> String {
    "ga:goalCompletionsAll".to_string()
}

fn default_page_size() -> u32 {
    10_000
}

fn default_reporting_api_url() -> String {
    DEFAULT_REPORTING_API_URL.to_string()
}

fn default_bigquery_api_url() -> String {
    DEFAULT_BIGQUERY_API_URL.to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_token_buffer() -> u64 {
    60
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.view_id.trim().is_empty() {
            return Err(ConfigError::MissingField("view_id".into()));
        }
        if self.destination_table.trim().is_empty() {
            return Err(ConfigError::MissingField("destination_table".into()));
        }
        self.destination()?;

        if let Some(token) = &self.access_token {
            if token.is_empty() {
                return Err(ConfigError::Invalid("access_token must not be empty".into()));
            }
        }

        if !self.goal_metric.starts_with("ga:") {
            return Err(ConfigError::Invalid(format!(
                "goal_metric '{}' must start with 'ga:'",
                self.goal_metric
            )));
        }

        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.page_size
            )));
        }

        if let Some(base) = &self.site_base_url {
            if !base.starts_with("http://") && !base.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "site_base_url '{}' must start with http:// or https://",
                    base
                )));
            }
        }

        Ok(())
    }

    /// Parsed destination table reference.
    pub fn destination(&self) -> Result<TableRef, ConfigError> {
        self.destination_table.parse().map_err(ConfigError::Invalid)
    }

    /// Get timeout as Duration.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }

    /// Get token refresh buffer as chrono Duration.
    pub fn token_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_buffer_seconds as i64)
    }
}
