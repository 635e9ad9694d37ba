use crate::streaming::{FrameStream, HttpChunkStream};
use crate::{utils, Answer, ApiError, Cleanup, EventCallback, Fragment, Provider};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiMessage>,
}

#[derive(Debug, Serialize)]
struct GeminiMessage {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

/// Provider for the Gemini `streamGenerateContent` endpoint.
///
/// The endpoint streams a JSON array of response objects without any SSE
/// framing, so the body goes through the JSON stream decoder.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn default_base_url() -> String {
        "https://generativelanguage.googleapis.com".to_string()
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
        format!(
            "{}/v1beta/models/{}:streamGenerateContent",
            self.base_url, self.model
        )
    }

    pub(crate) fn parse_event(data: &str) -> Result<Option<Fragment>> {
        let response: GeminiResponse = serde_json::from_str(data)?;

        let text = response
            .candidates
            .and_then(|candidates| candidates.into_iter().next())
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts.into_iter().next())
            .and_then(|part| part.text);

        Ok(text.map(|text| Fragment {
            text,
            message_id: response.response_id,
            conversation_id: None,
        }))
    }

    async fn stream_answer(&self, prompt: &str, on_event: &EventCallback) -> Result<Answer> {
        let request = GeminiRequest {
            contents: vec![GeminiMessage {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: Some(prompt.to_string()),
                }],
            }],
        };

        let response = self
            .client
            .post(self.get_url())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let response = utils::check_response_error(response).await?;

        let mut frames = FrameStream::json(Box::new(HttpChunkStream::new(response)));
        utils::stream_fragments(&mut frames, Self::parse_event, on_event).await
    }
}

#[async_trait]
impl Provider for GeminiClient {
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
