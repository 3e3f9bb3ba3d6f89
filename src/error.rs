//! Unified error types for the GA3 backfill job.

use reqwest::StatusCode;
use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Credential loading and token exchange errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No credential file configured and GOOGLE_APPLICATION_CREDENTIALS is not set")]
    NotConfigured,

    #[error("Failed to read credential file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Malformed credential file '{path}': {source}")]
    Malformed {
        path: String,
        source: serde_json::Error,
    },

    #[error("Unsupported credential type '{0}' (expected service_account)")]
    UnsupportedType(String),

    #[error("Failed to sign token assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Token request failed with status {status}: {body}")]
    TokenRequestFailed { status: StatusCode, body: String },

    #[error("Token parse error: {0}")]
    TokenParse(String),

    #[error("Failed to create HTTP client: {0}")]
    HttpClientInit(String),
}

/// Transport errors from the reporting and warehouse APIs.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication error: {0}")]
    Auth(#[from] CredentialError),

    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body}")]
    HttpError { status: StatusCode, body: String },

    #[error("Google API error {code} [{status}]: {message}")]
    GoogleError {
        code: u16,
        status: String,
        message: String,
    },

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Failed to create HTTP client: {0}")]
    HttpClientInit(String),
}

/// Errors that abort a backfill run.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Invalid date format (expected YYYY-MM-DD): \"{0}\"")]
    InvalidDateFormat(String),

    #[error("Transport error: {0}")]
    Transport(#[source] ApiError),

    #[error("Table {0} has no rows to anchor the pull window")]
    NoWatermark(String),

    #[error("Malformed report: {0}")]
    MalformedReport(String),

    #[error("Load job {job_id} failed: {message}")]
    LoadJob { job_id: String, message: String },
}

/// Token failures surface as credential errors wherever they occur.
impl From<ApiError> for EtlError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Auth(credential) => EtlError::Credential(credential),
            other => EtlError::Transport(other),
        }
    }
}
