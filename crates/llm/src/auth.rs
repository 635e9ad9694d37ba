use crate::proxy::{FetchProxy, ProxyRequest};
use crate::ApiError;
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// How long a fetched session access token is reused
pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub value: String,
    pub expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Single-slot cache for the webapp session access token.
///
/// The slot lock is held across the fetch, so concurrent callers wait for
/// one in-flight fetch instead of racing their own.
pub struct AccessTokenCache {
    proxy: Arc<dyn FetchProxy>,
    session_url: String,
    ttl: Duration,
    current_token: Mutex<Option<CachedToken>>,
}

impl AccessTokenCache {
    pub fn new(proxy: Arc<dyn FetchProxy>, base_url: &str) -> Self {
        Self {
            proxy,
            session_url: format!("{}/api/auth/session", base_url.trim_end_matches('/')),
            ttl: ACCESS_TOKEN_TTL,
            current_token: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn get_access_token(&self) -> Result<String> {
        let mut slot = self.current_token.lock().await;

        if let Some(token) = slot.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.value.clone());
        }
        *slot = None;

        tracing::debug!("Requesting new access token...");
        let data = self
            .proxy
            .fetch(ProxyRequest::get(&self.session_url))
            .await?
            .into_json()?;

        let token = data
            .get("accessToken")
            .and_then(serde_json::Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized)?
            .to_string();

        *slot = Some(CachedToken {
            value: token.clone(),
            expires_at: Instant::now() + self.ttl,
        });

        Ok(token)
    }

    /// Cached token if it has not expired yet. Never fetches.
    pub async fn get(&self) -> Option<String> {
        self.current_token
            .lock()
            .await
            .as_ref()
            .filter(|token| token.is_fresh())
            .map(|token| token.value.clone())
    }

    pub async fn set(&self, value: String) {
        *self.current_token.lock().await = Some(CachedToken {
            value,
            expires_at: Instant::now() + self.ttl,
        });
    }

    pub async fn clear(&self) {
        tracing::debug!("Clearing cached access token");
        *self.current_token.lock().await = None;
    }
}
