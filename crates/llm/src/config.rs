use crate::{ApiError, ChatGptWebClient, GeminiClient, OpenAIClient};
use serde::{Deserialize, Serialize};

/// Which provider answers a question
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum ProviderKind {
    /// Logged-in ChatGPT webapp session
    #[default]
    #[serde(rename = "chatgpt")]
    #[value(name = "chatgpt")]
    ChatGpt,
    /// OpenAI completions API with an API key
    #[serde(rename = "openai")]
    #[value(name = "openai")]
    OpenAI,
    /// Gemini streaming API with an API key
    #[serde(rename = "gemini")]
    #[value(name = "gemini")]
    Gemini,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProviderKind::ChatGpt => "chatgpt",
            ProviderKind::OpenAI => "openai",
            ProviderKind::Gemini => "gemini",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ApiCredentials {
    fn complete(&self) -> Option<(String, String)> {
        let api_key = self.api_key.as_deref().map(str::trim).unwrap_or_default();
        let model = self.model.as_deref().map(str::trim).unwrap_or_default();
        if api_key.is_empty() || model.is_empty() {
            return None;
        }
        Some((api_key.to_string(), model.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Persisted provider selection plus per-provider settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfigs {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub chatgpt: SessionSettings,
    #[serde(default)]
    pub openai: ApiCredentials,
    #[serde(default)]
    pub gemini: ApiCredentials,
}

/// Validated settings for constructing one provider
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderConfig {
    Session {
        base_url: String,
    },
    Api {
        api_key: String,
        model: String,
        base_url: String,
    },
    StreamingApi {
        api_key: String,
        model: String,
        base_url: String,
    },
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Session { .. } => ProviderKind::ChatGpt,
            ProviderConfig::Api { .. } => ProviderKind::OpenAI,
            ProviderConfig::StreamingApi { .. } => ProviderKind::Gemini,
        }
    }
}

impl ProviderConfigs {
    pub fn session_base_url(&self) -> String {
        self.chatgpt
            .base_url
            .clone()
            .unwrap_or_else(ChatGptWebClient::default_base_url)
    }

    /// Validate the settings of the selected provider (or `override_kind`).
    ///
    /// Key based providers need both an API key and a model.
    pub fn resolve(&self, override_kind: Option<ProviderKind>) -> Result<ProviderConfig, ApiError> {
        match override_kind.unwrap_or(self.provider) {
            ProviderKind::ChatGpt => Ok(ProviderConfig::Session {
                base_url: self.session_base_url(),
            }),
            ProviderKind::OpenAI => {
                let (api_key, model) = self.openai.complete().ok_or_else(|| {
                    ApiError::Configuration("API key or model not set for OpenAI API".to_string())
                })?;
                Ok(ProviderConfig::Api {
                    api_key,
                    model,
                    base_url: self
                        .openai
                        .base_url
                        .clone()
                        .unwrap_or_else(OpenAIClient::default_base_url),
                })
            }
            ProviderKind::Gemini => {
                let (api_key, model) = self.gemini.complete().ok_or_else(|| {
                    ApiError::Configuration("API key or model not set for Gemini API".to_string())
                })?;
                Ok(ProviderConfig::StreamingApi {
                    api_key,
                    model,
                    base_url: self
                        .gemini
                        .base_url
                        .clone()
                        .unwrap_or_else(GeminiClient::default_base_url),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_selects_session_provider() {
        let configs = ProviderConfigs::default();
        assert_eq!(
            configs.resolve(None).unwrap(),
            ProviderConfig::Session {
                base_url: "https://chat.openai.com".to_string()
            }
        );
    }

    #[test]
    fn api_providers_require_key_and_model() {
        let mut configs = ProviderConfigs {
            provider: ProviderKind::OpenAI,
            ..Default::default()
        };
        let error = configs.resolve(None).unwrap_err();
        assert_eq!(error.to_string(), "API key or model not set for OpenAI API");
        assert_eq!(error.kind(), crate::ErrorKind::Configuration);

        configs.openai.api_key = Some("sk-test".to_string());
        configs.openai.model = Some("   ".to_string());
        assert!(configs.resolve(None).is_err());

        configs.openai.model = Some("text-davinci-003".to_string());
        assert_eq!(
            configs.resolve(None).unwrap(),
            ProviderConfig::Api {
                api_key: "sk-test".to_string(),
                model: "text-davinci-003".to_string(),
                base_url: "https://api.openai.com".to_string(),
            }
        );
    }

    #[test]
    fn override_wins_over_selection() {
        let configs = ProviderConfigs {
            provider: ProviderKind::ChatGpt,
            gemini: ApiCredentials {
                api_key: Some("g-key".to_string()),
                model: Some("gemini-pro".to_string()),
                base_url: Some("http://localhost:9".to_string()),
            },
            ..Default::default()
        };

        let resolved = configs.resolve(Some(ProviderKind::Gemini)).unwrap();
        assert_eq!(resolved.kind(), ProviderKind::Gemini);

        let error = configs.resolve(Some(ProviderKind::OpenAI)).unwrap_err();
        assert_eq!(error.to_string(), "API key or model not set for OpenAI API");
    }

    #[test]
    fn provider_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ProviderKind::OpenAI).unwrap();
        assert_eq!(json, "\"openai\"");
        let kind: ProviderKind = serde_json::from_str("\"chatgpt\"").unwrap();
        assert_eq!(kind, ProviderKind::ChatGpt);
        assert_eq!(ProviderKind::Gemini.to_string(), "gemini");
    }
}
