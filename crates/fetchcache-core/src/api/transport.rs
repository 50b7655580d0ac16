//! The network boundary of the access layer.
//!
//! The client never talks to an HTTP library directly; it hands a URL and a
//! [`RequestInit`] to a [`Transport`] and gets back a status and body. The
//! production implementation is [`ReqwestTransport`]; tests substitute their
//! own.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use tracing::trace;

use super::request::Method;
use super::ApiError;

/// Everything a transport needs besides the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInit {
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// A fully received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON.
    ///
    /// An empty body parses as JSON `null`, which lets `DELETE` endpoints
    /// answering `204 No Content` be requested as `serde_json::Value` or `()`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let body: &[u8] = if self.body.iter().all(u8::is_ascii_whitespace) {
            b"null"
        } else {
            &self.body
        };
        serde_json::from_slice(body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

/// A fetch-like function: send one request, report connection failures as
/// [`ApiError::Network`], and return any response that arrived regardless of
/// its status.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, url: &str, init: RequestInit) -> Result<TransportResponse, ApiError>;
}

/// HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Transport backed by `reqwest`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client, sharing its connection pool.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn headers(init: &RequestInit) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        for (name, value) in &init.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ApiError::Serialization(format!("header name {name:?}: {e}")))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| ApiError::Serialization(format!("header value for {name}: {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, url: &str, init: RequestInit) -> Result<TransportResponse, ApiError> {
        let method = match init.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, url)
            .headers(Self::headers(&init)?);
        if let Some(body) = init.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        trace!(url = url, status = status, bytes = body.len(), "Response received");

        Ok(TransportResponse::new(status, body.to_vec()))
    }
}
