//! Provider integration for streamed search-page answers
//!
//! This module implements:
//! - Common interface for answer generation via the Provider trait
//! - Providers for the ChatGPT webapp session, the OpenAI completions API and Gemini
//! - Incremental decoding of SSE and concatenated-JSON response bodies
//! - Session access token caching and the fetch proxy used by the webapp provider
//! - Provider configuration and the factory that selects a provider per session


mod utils;

pub mod auth;
pub mod chatgpt;
pub mod config;
pub mod factory;
pub mod gemini;
pub mod openai;
pub mod proxy;
pub mod streaming;
pub mod types;

pub use auth::AccessTokenCache;
pub use chatgpt::ChatGptWebClient;
pub use config::{ApiCredentials, ProviderConfig, ProviderConfigs, ProviderKind};
pub use factory::{ProviderFactory, ProviderResolver};
pub use gemini::GeminiClient;
pub use openai::OpenAIClient;
pub use proxy::{DirectFetchProxy, FetchProxy, ProxyRequest, ProxyResponse};
pub use types::*;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// Receives every event of one answer session, in order
pub type EventCallback = Box<dyn Fn(AnswerEvent) + Send + Sync>;

/// Provider specific teardown that runs after a cancelled session
pub type Cleanup = BoxFuture<'static, ()>;

/// Trait for the answer providers
#[async_trait]
pub trait Provider: Send + Sync {
    /// Streams an answer for `prompt` through `on_event`.
    ///
    /// Emits zero or more `Answer` snapshots followed by exactly one `Done`
    /// or `Error`. If `cancel` fires first, the in-flight request is dropped
    /// and no terminal event is emitted. The returned cleanup (if any) is
    /// for the caller to run once the session is abandoned.
    async fn generate_answer(
        &self,
        prompt: &str,
        on_event: &EventCallback,
        cancel: CancellationToken,
    ) -> Option<Cleanup>;
}
