use serde::{Deserialize, Serialize};

/// The answer assembled so far for one session.
///
/// `text` only ever grows. `message_id` and `conversation_id` reflect the most
/// recent fragment that carried them.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl Answer {
    /// Merge a decoded fragment into the answer.
    ///
    /// Returns true if the text changed.
    pub fn merge(&mut self, fragment: Fragment) -> bool {
        if fragment.message_id.is_some() {
            self.message_id = fragment.message_id;
        }
        if fragment.conversation_id.is_some() {
            self.conversation_id = fragment.conversation_id;
        }
        if fragment.text.is_empty() {
            return false;
        }
        self.text.push_str(&fragment.text);
        true
    }
}

/// One decoded unit of provider output
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fragment {
    pub text: String,
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Events delivered to the UI side while a session is running
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerEvent {
    /// Updated snapshot of the cumulative answer
    Answer(Answer),
    /// Natural end of the stream
    Done,
    /// Terminal failure of the session
    Error {
        message: String,
        kind: Option<ErrorKind>,
    },
}

impl AnswerEvent {
    pub fn from_error(error: &anyhow::Error) -> Self {
        AnswerEvent::Error {
            message: error_message(error),
            kind: Some(ErrorKind::classify(error)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnswerEvent::Done | AnswerEvent::Error { .. })
    }
}

/// Message of the root `ApiError` if there is one, otherwise the outermost message.
fn error_message(error: &anyhow::Error) -> String {
    match error.downcast_ref::<ApiError>() {
        Some(api_error) => api_error.to_string(),
        None => error.to_string(),
    }
}

/// Machine-checkable classification of a session failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Unauthorized,
    Cloudflare,
    Transport,
    Decode,
}

impl ErrorKind {
    pub fn classify(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<ApiError>() {
            Some(api_error) => api_error.kind(),
            None => ErrorKind::Transport,
        }
    }

    /// Authorization failures that may succeed after the user logs in again.
    pub fn is_reauthorizable(&self) -> bool {
        matches!(self, ErrorKind::Unauthorized | ErrorKind::Cloudflare)
    }
}

/// Common error types for all providers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Configuration(String),

    #[error("UNAUTHORIZED")]
    Unauthorized,

    #[error("CLOUDFLARE")]
    Cloudflare,

    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Configuration(_) => ErrorKind::Configuration,
            ApiError::Unauthorized => ErrorKind::Unauthorized,
            ApiError::Cloudflare => ErrorKind::Cloudflare,
            ApiError::Http { .. } | ApiError::Network(_) => ErrorKind::Transport,
            ApiError::Decode(_) => ErrorKind::Decode,
        }
    }
}
