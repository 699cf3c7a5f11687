//! Transport for upload requests

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, ETAG, LAST_MODIFIED, LOCATION};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use thiserror::Error;

use super::request::{HttpVerb, UploadRequest};
use crate::util::{compact_text, is_http_url, normalize_text_option};

const FHIR_JSON: &str = "application/fhir+json";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid data source configuration: {0}")]
    InvalidConfiguration(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid response payload: {0}")]
    InvalidPayload(String),
}

impl From<TransportError> for crate::Error {
    fn from(error: TransportError) -> Self {
        Self::Transport(error.to_string())
    }
}

/// What the server sent back for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadResponse {
    /// Parsed body, `null` when the server sent none
    pub body: Value,
    pub etag: Option<String>,
    pub location: Option<String>,
    pub last_modified: Option<String>,
}

/// Something that can deliver upload requests to a server
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Send one request and return the raw response
    async fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError>;
}

/// `reqwest`-backed data source talking to a FHIR-style REST server
#[derive(Clone)]
pub struct HttpDataSource {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpDataSource {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpDataSource")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpDataSource {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            auth_token: normalize_text_option(auth_token),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, relative: &str) -> String {
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{relative}", self.base_url)
        }
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError> {
        let method = match request.method {
            HttpVerb::Post => Method::POST,
            HttpVerb::Put => Method::PUT,
            HttpVerb::Patch => Method::PATCH,
            HttpVerb::Delete => Method::DELETE,
        };
        let url = self.url_for(&request.url);
        tracing::debug!("{method} {url}");

        let mut builder = self
            .client
            .request(method, &url)
            .header(ACCEPT, FHIR_JSON);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            if !request
                .headers
                .keys()
                .any(|name| name.eq_ignore_ascii_case("content-type"))
            {
                builder = builder.header(CONTENT_TYPE, FHIR_JSON);
            }
            builder = builder.body(body.to_string());
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str::<Value>(&text) {
                Ok(body) => body,
                Err(_) if !status.is_success() => {
                    return Err(status_error(status, &text));
                }
                Err(error) => return Err(TransportError::InvalidPayload(error.to_string())),
            }
        };

        // Structured rejections are classified by the uploader
        if !status.is_success() && body["resourceType"] != "OperationOutcome" {
            return Err(status_error(status, &text));
        }

        Ok(UploadResponse {
            body,
            etag: header_value(&headers, &ETAG),
            location: header_value(&headers, &LOCATION),
            last_modified: header_value(&headers, &LAST_MODIFIED),
        })
    }
}

fn header_value(headers: &HeaderMap, name: &reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .and_then(|value| normalize_text_option(Some(value)))
}

fn status_error(status: StatusCode, body: &str) -> TransportError {
    TransportError::Status {
        status: status.as_u16(),
        body: compact_text(body),
    }
}

fn normalize_base_url(raw: String) -> Result<String, TransportError> {
    let base_url = normalize_text_option(Some(raw)).ok_or_else(|| {
        TransportError::InvalidConfiguration("server base URL must not be empty".to_string())
    })?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(TransportError::InvalidConfiguration(
            "server base URL must include http:// or https://".to_string(),
        ))
    }
}
