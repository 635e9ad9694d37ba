use crate::proxy::{FetchProxy, ProxyRequest};
use crate::streaming::FrameStream;
use crate::{utils, Answer, Cleanup, EventCallback, Fragment, Provider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Model used when the model listing is unavailable
pub const FALLBACK_MODEL: &str = "text-davinci-002-render";

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    slug: String,
}

#[derive(Debug, Serialize)]
struct ConversationRequest {
    action: &'static str,
    messages: Vec<ConversationMessage>,
    model: String,
    parent_message_id: String,
}

#[derive(Debug, Serialize)]
struct ConversationMessage {
    id: String,
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
struct MessageContent {
    content_type: &'static str,
    parts: Vec<String>,
}

/// Rating sent with message feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum FeedbackRating {
    ThumbsUp,
    ThumbsDown,
}

/// Provider backed by the user's logged-in ChatGPT webapp session.
///
/// All backend calls go through the [`FetchProxy`]. The webapp keeps every
/// conversation, so cancelled sessions hide theirs again on cleanup.
pub struct ChatGptWebClient {
    token: String,
    base_url: String,
    proxy: Arc<dyn FetchProxy>,
}

impl ChatGptWebClient {
    pub fn default_base_url() -> String {
        "https://chat.openai.com".to_string()
    }

    pub fn new(token: String, base_url: String, proxy: Arc<dyn FetchProxy>) -> Self {
        Self {
            token,
            base_url: base_url.trim_end_matches('/').to_string(),
            proxy,
        }
    }

    fn backend_request(&self, method: Method, path: &str) -> ProxyRequest {
        backend_request(&self.base_url, &self.token, method, path)
    }

    async fn fetch_models(&self) -> Result<Vec<String>> {
        let value = self
            .proxy
            .fetch(self.backend_request(Method::GET, "/models"))
            .await?
            .into_json()?;
        let list: ModelList = serde_json::from_value(value).context("Invalid model list")?;
        Ok(list.models.into_iter().map(|model| model.slug).collect())
    }

    async fn model_name(&self) -> String {
        match self.fetch_models().await {
            Ok(models) if !models.is_empty() => models[0].clone(),
            Ok(_) => FALLBACK_MODEL.to_string(),
            Err(e) => {
                warn!("Failed to fetch models, using {}: {:#}", FALLBACK_MODEL, e);
                FALLBACK_MODEL.to_string()
            }
        }
    }

    fn conversation_request(prompt: &str, model: String) -> ConversationRequest {
        ConversationRequest {
            action: "next",
            messages: vec![ConversationMessage {
                id: uuid::Uuid::new_v4().to_string(),
                role: "user",
                content: MessageContent {
                    content_type: "text",
                    parts: vec![prompt.to_string()],
                },
            }],
            model,
            parent_message_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Decode one conversation event.
    ///
    /// Every event carries the full message so far. Only the suffix beyond
    /// `seen` is returned as fragment text, so merging fragments reproduces
    /// the message.
    pub(crate) fn parse_event(data: &str, seen: &mut String) -> Result<Option<Fragment>> {
        let value: serde_json::Value = serde_json::from_str(data)?;

        let Some(full_text) = value
            .pointer("/message/content/parts/0")
            .and_then(serde_json::Value::as_str)
        else {
            return Ok(None);
        };

        let delta = match full_text.strip_prefix(seen.as_str()) {
            Some(rest) => rest.to_string(),
            None => {
                // Message was rewritten rather than extended
                debug!("Conversation text diverged from what was already streamed");
                String::new()
            }
        };
        if full_text.len() > seen.len() {
            *seen = full_text.to_string();
        }

        Ok(Some(Fragment {
            text: delta,
            message_id: utils::str_at(&value, "/message/id"),
            conversation_id: utils::str_at(&value, "/conversation_id"),
        }))
    }

    async fn stream_answer(
        &self,
        prompt: &str,
        on_event: &EventCallback,
        conversation_id: &mut Option<String>,
    ) -> Result<Answer> {
        let model = self.model_name().await;
        debug!("Using model {}", model);

        let body = serde_json::to_value(Self::conversation_request(prompt, model))?;
        let source = self
            .proxy
            .fetch(
                self.backend_request(Method::POST, "/conversation")
                    .json(&body)
                    .streaming(),
            )
            .await?
            .into_stream()?;

        let mut frames = FrameStream::sse(source);
        let mut seen = String::new();
        utils::stream_fragments(
            &mut frames,
            |data| {
                let fragment = Self::parse_event(data, &mut seen)?;
                if let Some(id) = fragment.as_ref().and_then(|f| f.conversation_id.clone()) {
                    *conversation_id = Some(id);
                }
                Ok(fragment)
            },
            on_event,
        )
        .await
    }

    fn hide_conversation(&self, conversation_id: String) -> Cleanup {
        let request = self
            .backend_request(Method::PATCH, &format!("/conversation/{conversation_id}"))
            .json(&json!({ "is_visible": false }));
        let proxy = self.proxy.clone();

        Box::pin(async move {
            debug!("Hiding conversation {}", conversation_id);
            if let Err(e) = proxy.fetch(request).await {
                warn!("Failed to hide conversation {}: {:#}", conversation_id, e);
            }
        })
    }
}

#[async_trait]
impl Provider for ChatGptWebClient {
    async fn generate_answer(
        &self,
        prompt: &str,
        on_event: &EventCallback,
        cancel: CancellationToken,
    ) -> Option<Cleanup> {
        let mut conversation_id = None;
        let stream = self.stream_answer(prompt, on_event, &mut conversation_id);
        utils::drive_to_terminal(stream, on_event, &cancel).await;

        conversation_id.map(|id| self.hide_conversation(id))
    }
}

fn backend_request(base_url: &str, token: &str, method: Method, path: &str) -> ProxyRequest {
    ProxyRequest::new(method, format!("{base_url}/backend-api{path}")).bearer(token)
}

/// Rate a message of a webapp conversation.
pub async fn send_message_feedback(
    proxy: &dyn FetchProxy,
    base_url: &str,
    token: &str,
    message_id: &str,
    conversation_id: &str,
    rating: FeedbackRating,
) -> Result<()> {
    let body = json!({
        "message_id": message_id,
        "conversation_id": conversation_id,
        "rating": rating,
    });
    proxy
        .fetch(
            backend_request(
                base_url.trim_end_matches('/'),
                token,
                Method::POST,
                "/conversation/message_feedback",
            )
            .json(&body),
        )
        .await
        .context("Failed to send message feedback")?;
    Ok(())
}
