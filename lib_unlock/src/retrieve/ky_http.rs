//! # HTTP Retrieval Utilities
//!
//! A small asynchronous API client wrapper around `reqwest`, used for the
//! routing engine's control plane. It handles the base URL, bearer
//! authentication, a per-request timeout and standardized JSON response
//! handling.
//!
//! There is deliberately no retry layer: a control-plane call either answers
//! within its timeout or the caller reports the failure.

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Failures of a control-plane exchange that are not plain HTTP statuses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The configured base URL is not an absolute URL.
    #[error("Invalid base URL '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The base URL cannot take path segments (e.g. `mailto:`).
    #[error("Base URL '{0}' cannot carry a path")]
    CannotBeABase(String),

    /// Connection, timeout or protocol failure.
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The request body could not be serialized.
    #[error("Request body encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// A 2xx body did not match the expected shape.
    #[error("Response decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A standardized container for API responses.
///
/// Non-2xx statuses are not errors at this level: they come back with
/// `success == false` and the raw body in `error_body`.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body of a 2xx response. `None` for empty bodies (204).
    pub data: Option<T>,
    /// The raw body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// # Api Client
///
/// Asynchronous HTTP client bound to one base URL.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: reqwest::Client,
    /// The base URL to which all path segments are appended.
    base_url: Url,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client for `base_url`.
    ///
    /// System proxy settings are ignored: the control plane is always reached
    /// directly.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidBaseUrl`] when `base_url` is not absolute.
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let url = Url::parse(base_url).map_err(|e| ApiError::InvalidBaseUrl {
            url: base_url.to_string(),
            source: e,
        })?;
        if url.cannot_be_a_base() {
            return Err(ApiError::CannotBeABase(base_url.to_string()));
        }

        let inner = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            inner,
            base_url: url,
            auth_token: auth_token.filter(|t| !t.is_empty()),
        })
    }

    /// Appends percent-encoded `segments` to the base URL.
    ///
    /// Segments are taken literally, so names containing `/`, spaces or
    /// non-ASCII characters stay a single path segment.
    pub fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::CannotBeABase(self.base_url.to_string()))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    /// Performs an HTTP request and handles the response.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, PUT, ...).
    /// * `segments` - Path segments appended to the base URL.
    /// * `headers` - Optional additional headers for this request.
    /// * `body` - Optional serializable object sent as the JSON body.
    ///
    /// # Errors
    /// Transport failures, timeouts, and undecodable 2xx bodies. HTTP error
    /// statuses are reported through [`ApiResponse::success`].
    pub async fn request<T, B>(
        &self,
        method: Method,
        segments: &[&str],
        headers: Option<HeaderMap>,
        body: Option<&B>,
    ) -> Result<ApiResponse<T>, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let full_url = self.url(segments)?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(b) = body {
            let json_body = serde_json::to_string(b).map_err(ApiError::Encode)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let text = response.text().await?;
            let data = if text.trim().is_empty() {
                None
            } else {
                Some(serde_json::from_str::<T>(&text).map_err(ApiError::Decode)?)
            };
            Ok(ApiResponse {
                data,
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// GET shorthand.
    pub async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
    ) -> Result<ApiResponse<T>, ApiError> {
        self.request::<T, ()>(Method::GET, segments, None, None).await
    }
}
