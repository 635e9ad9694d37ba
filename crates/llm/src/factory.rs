use crate::auth::AccessTokenCache;
use crate::proxy::FetchProxy;
use crate::{
    ChatGptWebClient, GeminiClient, OpenAIClient, Provider, ProviderConfig, ProviderConfigs,
    ProviderKind,
};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Builds the provider for one answer session
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn create(
        &self,
        configs: &ProviderConfigs,
        override_kind: Option<ProviderKind>,
    ) -> Result<Box<dyn Provider>>;
}

pub struct ProviderFactory {
    token_cache: Arc<AccessTokenCache>,
    proxy: Arc<dyn FetchProxy>,
}

impl ProviderFactory {
    pub fn new(token_cache: Arc<AccessTokenCache>, proxy: Arc<dyn FetchProxy>) -> Self {
        Self { token_cache, proxy }
    }
}

#[async_trait]
impl ProviderResolver for ProviderFactory {
    /// Configuration errors surface before any network access. The session
    /// provider needs an access token first, so its failures (UNAUTHORIZED,
    /// CLOUDFLARE) surface from here too.
    async fn create(
        &self,
        configs: &ProviderConfigs,
        override_kind: Option<ProviderKind>,
    ) -> Result<Box<dyn Provider>> {
        let config = configs.resolve(override_kind)?;
        debug!("Creating {} provider", config.kind());

        match config {
            ProviderConfig::Session { base_url } => {
                let token = self.token_cache.get_access_token().await?;
                Ok(Box::new(ChatGptWebClient::new(
                    token,
                    base_url,
                    self.proxy.clone(),
                )))
            }
            ProviderConfig::Api {
                api_key,
                model,
                base_url,
            } => Ok(Box::new(OpenAIClient::new(api_key, model, base_url))),
            ProviderConfig::StreamingApi {
                api_key,
                model,
                base_url,
            } => Ok(Box::new(GeminiClient::new(api_key, model, base_url))),
        }
    }
}
