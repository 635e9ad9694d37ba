use crate::streaming::{FrameStream, HttpChunkStream};
use crate::{utils, Answer, ApiError, Cleanup, EventCallback, Fragment, Provider};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Turn delimiters some completion models stream as literal text
const SENTINEL_TOKENS: [&str; 2] = ["<|im_end|>", "<|im_sep|>"];

/// Models that expect the chat-style prompt template
const CHAT_MODEL_PREFIX: &str = "text-chat-davinci";

const MAX_TOKENS: u32 = 2048;

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

/// Provider for the OpenAI text completions API
pub struct OpenAIClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAIClient {
    pub fn default_base_url() -> String {
        "https://api.openai.com".to_string()
    }

    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn get_url(&self) -> String {
        format!("{}/v1/completions", self.base_url)
    }

    pub(crate) fn build_prompt(model: &str, prompt: &str) -> String {
        if model.starts_with(CHAT_MODEL_PREFIX) {
            format!("Respond conversationally.<|im_end|>\n\nUser: {prompt}<|im_sep|>\nChatGPT:")
        } else {
            prompt.to_string()
        }
    }

    /// Decode one completion chunk. The chunk id doubles as message and
    /// conversation id.
    pub(crate) fn parse_event(data: &str) -> Result<Option<Fragment>> {
        let chunk: CompletionChunk = serde_json::from_str(data)?;
        let text = chunk
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text)
            .unwrap_or_default();

        if SENTINEL_TOKENS.contains(&text.as_str()) {
            debug!("Skipping sentinel token {}", text);
            return Ok(None);
        }

        Ok(Some(Fragment {
            text,
            message_id: chunk.id.clone(),
            conversation_id: chunk.id,
        }))
    }

    async fn stream_answer(&self, prompt: &str, on_event: &EventCallback) -> Result<Answer> {
        let request = CompletionRequest {
            model: &self.model,
            prompt: Self::build_prompt(&self.model, prompt),
            stream: true,
            max_tokens: MAX_TOKENS,
        };

        let response = self
            .client
            .post(self.get_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let response = utils::check_response_error(response).await?;

        let mut frames = FrameStream::sse(Box::new(HttpChunkStream::new(response)));
        utils::stream_fragments(&mut frames, Self::parse_event, on_event).await
    }
}

#[async_trait]
impl Provider for OpenAIClient {
    async fn generate_answer(
        &self,
        prompt: &str,
        on_event: &EventCallback,
        cancel: CancellationToken,
    ) -> Option<Cleanup> {
        utils::drive_to_terminal(self.stream_answer(prompt, on_event), on_event, &cancel).await;
        None
    }
}
