//! Fetch indirection for the session-backed provider.
//!
//! Requests against the webapp backend are routed through a [`FetchProxy`]
//! so they can be executed from an isolated context that carries the
//! browser session (and passes anti-bot checks). The proxy either buffers a
//! JSON result or hands back the raw body as a [`ChunkStream`].

use crate::streaming::{ChunkStream, HttpChunkStream};
use crate::{utils, ApiError};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub streaming: bool,
}

impl ProxyRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: None,
            streaming: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {token}")));
        self
    }

    pub fn json(mut self, body: &serde_json::Value) -> Self {
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        self.body = Some(body.to_string());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

pub enum ProxyResponse {
    Json(serde_json::Value),
    Stream(Box<dyn ChunkStream>),
}

impl ProxyResponse {
    pub fn into_json(self) -> Result<serde_json::Value> {
        match self {
            ProxyResponse::Json(value) => Ok(value),
            ProxyResponse::Stream(_) => Err(ApiError::Decode(
                "Expected a buffered JSON response, got a stream".to_string(),
            )
            .into()),
        }
    }

    pub fn into_stream(self) -> Result<Box<dyn ChunkStream>> {
        match self {
            ProxyResponse::Stream(stream) => Ok(stream),
            ProxyResponse::Json(_) => Err(ApiError::Decode(
                "Expected a streaming response, got buffered JSON".to_string(),
            )
            .into()),
        }
    }
}

#[async_trait]
pub trait FetchProxy: Send + Sync {
    async fn fetch(&self, request: ProxyRequest) -> Result<ProxyResponse>;
}

/// Proxy that performs the request in-process.
///
/// A 403 is reported as [`ApiError::Cloudflare`], since that is how the
/// anti-bot challenge surfaces to non-browser clients.
pub struct DirectFetchProxy {
    client: Client,
}

impl DirectFetchProxy {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for DirectFetchProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FetchProxy for DirectFetchProxy {
    async fn fetch(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        debug!("Proxy {} {}", request.method, request.url);

        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if response.status() == StatusCode::FORBIDDEN {
            return Err(ApiError::Cloudflare.into());
        }
        let response = utils::check_response_error(response).await?;

        if request.streaming {
            return Ok(ProxyResponse::Stream(Box::new(HttpChunkStream::new(
                response,
            ))));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(ProxyResponse::Json(serde_json::Value::Null));
        }
        let value = serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(ProxyResponse::Json(value))
    }
}
