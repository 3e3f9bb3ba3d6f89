//! Service-account authentication for Google APIs.
//!
//! Loads a service-account key file and exchanges a signed JWT assertion for
//! an access token (OAuth2 JWT bearer grant). Tokens are cached until shortly
//! before they expire. A static bearer token can be configured instead.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::CredentialError;

/// Read-only scope for the Analytics Reporting API.
pub const ANALYTICS_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/analytics.readonly";

/// Scope for BigQuery queries and load jobs.
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

/// Environment variable consulted when no key file is configured.
const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for each signed assertion (Google's maximum).
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Header used to attribute quota to a project other than the key's own.
const QUOTA_PROJECT_HEADER: &str = "x-goog-user-project";

/// Contents of a service-account JSON key file.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub project_id: Option<String>,
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    /// Read and parse a key file.
    pub fn from_file(path: &Path) -> Result<Self, CredentialError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| CredentialError::Read {
            path: display.clone(),
            source,
        })?;
        let key: ServiceAccountKey =
            serde_json::from_str(&content).map_err(|source| CredentialError::Malformed {
                path: display,
                source,
            })?;

        if key.key_type != "service_account" {
            return Err(CredentialError::UnsupportedType(key.key_type));
        }
        Ok(key)
    }
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("project_id", &self.project_id)
            .finish()
    }
}

/// Resolve the key file path, falling back to GOOGLE_APPLICATION_CREDENTIALS.
pub fn resolve_credentials_path(configured: Option<&Path>) -> Result<PathBuf, CredentialError> {
    resolve_path(configured, std::env::var_os(CREDENTIALS_ENV))
}

fn resolve_path(
    configured: Option<&Path>,
    env_value: Option<OsString>,
) -> Result<PathBuf, CredentialError> {
    match (configured, env_value) {
        (Some(path), _) => Ok(path.to_path_buf()),
        (None, Some(value)) if !value.is_empty() => Ok(PathBuf::from(value)),
        _ => Err(CredentialError::NotConfigured),
    }
}

/// Claims of the signed JWT assertion.
#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// OAuth2 token response from Google.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Cached token with expiration tracking.
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// Check if token is expired (with buffer).
    fn is_expired(&self, buffer: Duration) -> bool {
        Utc::now() + buffer >= self.expires_at
    }
}

#[derive(Clone)]
enum TokenSource {
    Static(String),
    ServiceAccount(Arc<ServiceAccountKey>),
}

/// Authenticated handle for one OAuth scope.
#[derive(Clone)]
pub struct GoogleAuth {
    source: TokenSource,
    scope: String,
    quota_project: Option<String>,
    http_client: Client,
    refresh_buffer: Duration,
    token_cache: Arc<RwLock<Option<CachedToken>>>,
}

impl GoogleAuth {
    /// Build an auth handle for `scope` from the process configuration.
    ///
    /// A configured `access_token` wins; otherwise the service-account key
    /// file is loaded (configured path, then GOOGLE_APPLICATION_CREDENTIALS).
    pub fn from_config(config: &Config, scope: &str) -> Result<Self, CredentialError> {
        if let Some(token) = &config.access_token {
            return Ok(Self::with_static_token(
                token.clone(),
                config.quota_project.clone(),
            ));
        }

        let path = resolve_credentials_path(config.credentials_file.as_deref())?;
        let key = ServiceAccountKey::from_file(&path)?;
        tracing::debug!(
            path = %path.display(),
            client_email = %key.client_email,
            "Loaded service-account credentials"
        );

        Self::service_account(
            key,
            scope,
            config.quota_project.clone(),
            config.timeout(),
            config.token_buffer(),
        )
    }

    /// Auth handle that always presents the same bearer token.
    pub fn with_static_token(token: String, quota_project: Option<String>) -> Self {
        Self {
            source: TokenSource::Static(token),
            scope: String::new(),
            quota_project,
            http_client: Client::new(),
            refresh_buffer: Duration::zero(),
            token_cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Auth handle backed by a service-account key.
    pub fn service_account(
        key: ServiceAccountKey,
        scope: &str,
        quota_project: Option<String>,
        timeout: std::time::Duration,
        refresh_buffer: Duration,
    ) -> Result<Self, CredentialError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialError::HttpClientInit(e.to_string()))?;

        Ok(Self {
            source: TokenSource::ServiceAccount(Arc::new(key)),
            scope: scope.to_string(),
            quota_project,
            http_client,
            refresh_buffer,
            token_cache: Arc::new(RwLock::new(None)),
        })
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_token(&self) -> Result<String, CredentialError> {
        let key = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount(key) => key,
        };

        {
            let cache = self.token_cache.read().await;
            if let Some(ref cached) = *cache {
                if !cached.is_expired(self.refresh_buffer) {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        self.fetch_token(key).await
    }

    /// Attach the bearer token and quota project to a request.
    pub async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, CredentialError> {
        let token = self.get_token().await?;
        let request = request.bearer_auth(token);
        Ok(match &self.quota_project {
            Some(project) => request.header(QUOTA_PROJECT_HEADER, project),
            None => request,
        })
    }

    /// Exchange a signed assertion for a new access token.
    async fn fetch_token(&self, key: &ServiceAccountKey) -> Result<String, CredentialError> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: &self.scope,
            aud: &key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = key.private_key_id.clone();
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
        let assertion = jsonwebtoken::encode(&header, &claims, &signing_key)?;

        tracing::debug!(token_uri = %key.token_uri, scope = %self.scope, "Fetching access token");

        let body = format!(
            "grant_type={}&assertion={}",
            urlencoding::encode(JWT_BEARER_GRANT),
            assertion
        );
        let response = self
            .http_client
            .post(&key.token_uri)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::TokenRequestFailed { status, body });
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            CredentialError::TokenParse(format!("Failed to parse token response: {}", e))
        })?;

        let expires_at = Utc::now() + Duration::seconds(token_response.expires_in);
        tracing::debug!(
            expires_at = %expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
            "Access token acquired"
        );

        let mut cache = self.token_cache.write().await;
        *cache = Some(CachedToken {
            access_token: token_response.access_token.clone(),
            expires_at,
        });

        Ok(token_response.access_token)
    }
}

impl std::fmt::Debug for GoogleAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            TokenSource::Static(_) => f
                .debug_struct("GoogleAuth")
                .field("mode", &"static")
                .finish(),
            TokenSource::ServiceAccount(key) => f
                .debug_struct("GoogleAuth")
                .field("client_email", &key.client_email)
                .field("scope", &self.scope)
                .finish(),
        }
    }
}
