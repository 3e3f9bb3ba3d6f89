//! Authenticated JSON transport shared by the Google API clients.

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::GoogleAuth;
use crate::error::ApiError;

/// Google API error envelope.
#[derive(Debug, Deserialize)]
pub struct GoogleErrorResponse {
    pub error: GoogleErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct GoogleErrorDetail {
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub status: String,
}

/// HTTP client that signs every request with a [`GoogleAuth`] handle.
#[derive(Clone)]
pub struct GoogleTransport {
    http_client: Client,
    auth: GoogleAuth,
    debug: bool,
}

impl GoogleTransport {
    /// Create a new transport.
    ///
    /// # Errors
    /// Returns `ApiError::HttpClientInit` if the HTTP client cannot be created.
    pub fn new(
        auth: GoogleAuth,
        timeout: std::time::Duration,
        debug: bool,
    ) -> Result<Self, ApiError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::HttpClientInit(e.to_string()))?;

        Ok(Self {
            http_client,
            auth,
            debug,
        })
    }

    /// Execute GET request.
    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        if self.debug {
            tracing::debug!(url = %url, "GET request");
        }

        let request = self
            .http_client
            .get(url)
            .header("Accept", "application/json");
        let response = self.auth.authorize(request).await?.send().await?;

        self.handle_response(response).await
    }

    /// Execute POST request with a JSON body.
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        if self.debug {
            tracing::debug!(url = %url, "POST request");
        }

        let request = self
            .http_client
            .post(url)
            .header("Accept", "application/json")
            .json(body);
        let response = self.auth.authorize(request).await?.send().await?;

        self.handle_response(response).await
    }

    /// Execute POST request with a pre-encoded body.
    pub async fn post_raw<T: DeserializeOwned>(
        &self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<T, ApiError> {
        if self.debug {
            tracing::debug!(url = %url, bytes = body.len(), "POST upload");
        }

        let request = self
            .http_client
            .post(url)
            .header("Content-Type", content_type)
            .header("Accept", "application/json")
            .body(body);
        let response = self.auth.authorize(request).await?.send().await?;

        self.handle_response(response).await
    }

    /// Handle HTTP response and parse JSON.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            if self.debug {
                tracing::debug!(status = %status, body = %truncate(&body, 500), "Response");
            }
            serde_json::from_str(&body).map_err(|e| {
                ApiError::UnexpectedResponse(format!(
                    "Failed to parse response: {} - Body: {}",
                    e,
                    truncate(&body, 200)
                ))
            })
        } else {
            if self.debug {
                tracing::debug!(status = %status, body = %body, "Error response");
            }
            Err(parse_error_response(status, &body))
        }
    }
}

impl std::fmt::Debug for GoogleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleTransport")
            .field("auth", &self.auth)
            .field("debug", &self.debug)
            .finish()
    }
}

/// Map an error body to the most specific `ApiError`.
fn parse_error_response(status: StatusCode, body: &str) -> ApiError {
    match serde_json::from_str::<GoogleErrorResponse>(body) {
        Ok(error) => ApiError::GoogleError {
            code: error.error.code,
            status: error.error.status,
            message: error.error.message,
        },
        Err(_) => ApiError::HttpError {
            status,
            body: body.to_string(),
        },
    }
}

/// Truncate a body on a char boundary for logging.
fn truncate(body: &str, max_len: usize) -> String {
    match body.char_indices().nth(max_len) {
        Some((idx, _)) => format!("{}...(truncated)", &body[..idx]),
        None => body.to_string(),
    }
}
