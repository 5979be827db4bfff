//! Wire transport beneath the rate-limited client.

use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::Serialize;

use crate::config::Secret;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

/// Channel-agnostic outbound call, shaped by a `ChannelAdapter`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelRequest {
    pub method: HttpMethod,
    /// Path relative to the connection endpoint.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ChannelRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Raw channel response. Returned for every HTTP status so credit headers
/// can be read from error responses too.
#[derive(Debug, Clone)]
pub struct ChannelResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl ChannelResponse {
    pub fn json(&self) -> Result<serde_json::Value, TransportError> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&self.body).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("channel call timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed channel response: {0}")]
    Malformed(String),
}

#[async_trait::async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send(&self, request: ChannelRequest) -> Result<ChannelResponse, TransportError>;
}

/// HTTP transport for one connection endpoint, authenticated with the
/// connection's api key as a bearer token.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Secret,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: Secret, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }
}

#[async_trait::async_trait]
impl ChannelTransport for HttpTransport {
    async fn send(&self, request: ChannelRequest) -> Result<ChannelResponse, TransportError> {
        let url = self.url(&request.path);
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
        };
        let mut builder = builder
            .bearer_auth(self.api_key.expose())
            .query(&request.query);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| map_reqwest_error(e, self.timeout))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|e| map_reqwest_error(e, self.timeout))?;

        tracing::debug!(url = %url, status, "channel call returned");
        Ok(ChannelResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_decode() || err.is_body() {
        TransportError::Malformed(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}
