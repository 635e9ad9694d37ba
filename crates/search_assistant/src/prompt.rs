use crate::settings::{Language, TriggerMode, UserConfig};
use llm::ErrorKind;

/// Prompt sent to the provider for a search query
pub fn build_prompt(question: &str, config: &UserConfig) -> String {
    match config.language {
        Language::Auto => question.to_string(),
        language => format!("{question}(in {language})"),
    }
}

pub fn ends_with_question_mark(question: &str) -> bool {
    // ASCII, fullwidth (Chinese/Japanese), Arabic and reversed
    ['?', '？', '؟', '⸮']
        .iter()
        .any(|mark| question.trim_end().ends_with(*mark))
}

/// Whether a query should be answered without being asked explicitly.
pub fn should_query(question: &str, trigger_mode: TriggerMode, forced: bool) -> bool {
    if forced {
        return true;
    }
    match trigger_mode {
        TriggerMode::Always => true,
        TriggerMode::QuestionMark => ends_with_question_mark(question),
        TriggerMode::Manually => false,
    }
}

/// User-facing hint shown below a failed answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHint {
    Relogin,
    Network,
    Model,
    ApiKey,
    Generic,
}

impl ErrorHint {
    pub fn classify(message: &str, kind: Option<ErrorKind>) -> Self {
        if kind.is_some_and(|kind| kind.is_reauthorizable()) {
            return ErrorHint::Relogin;
        }
        if message.to_lowercase().contains("network") || message.contains("Failed to fetch") {
            return ErrorHint::Network;
        }
        if message.contains("model") {
            return ErrorHint::Model;
        }
        if message.contains("API key") || message.contains("unauthorized") {
            return ErrorHint::ApiKey;
        }
        ErrorHint::Generic
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorHint::Relogin => {
                "Please log in at https://chat.openai.com and pass the security check, then retry."
            }
            ErrorHint::Network => "Network error, please check your connection and retry.",
            ErrorHint::Model => {
                "The selected model is not available, check `config set-provider --model`."
            }
            ErrorHint::ApiKey => "The API key is missing or invalid, check `config set-provider --api-key`.",
            ErrorHint::Generic => "Failed to load the answer, please retry.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_directive_is_appended() {
        let mut config = UserConfig::default();
        assert_eq!(build_prompt("What is Rust?", &config), "What is Rust?");

        config.language = Language::French;
        assert_eq!(
            build_prompt("What is Rust?", &config),
            "What is Rust?(in french)"
        );
    }

    #[test]
    fn question_marks_in_several_scripts() {
        assert!(ends_with_question_mark("what is rust?"));
        assert!(ends_with_question_mark("什么是 Rust？"));
        assert!(ends_with_question_mark("ما هو؟"));
        assert!(ends_with_question_mark("really⸮"));
        assert!(!ends_with_question_mark("rust tutorial"));
    }

    #[test]
    fn trigger_modes() {
        assert!(should_query("rust tutorial", TriggerMode::Always, false));
        assert!(!should_query("rust tutorial", TriggerMode::QuestionMark, false));
        assert!(should_query("is rust fast?", TriggerMode::QuestionMark, false));
        assert!(!should_query("is rust fast?", TriggerMode::Manually, false));
        assert!(should_query("rust tutorial", TriggerMode::Manually, true));
    }

    #[test]
    fn error_hints() {
        assert_eq!(
            ErrorHint::classify("UNAUTHORIZED", Some(ErrorKind::Unauthorized)),
            ErrorHint::Relogin
        );
        assert_eq!(
            ErrorHint::classify("Network error: connection refused", Some(ErrorKind::Transport)),
            ErrorHint::Network
        );
        assert_eq!(
            ErrorHint::classify(
                r#"{"error":{"message":"The model `x` does not exist"}}"#,
                Some(ErrorKind::Transport)
            ),
            ErrorHint::Model
        );
        assert_eq!(
            ErrorHint::classify(
                "API key or model not set for Gemini API",
                Some(ErrorKind::Configuration)
            ),
            ErrorHint::Model
        );
        assert_eq!(
            ErrorHint::classify("Incorrect API key provided", None),
            ErrorHint::ApiKey
        );
        assert_eq!(ErrorHint::classify("500 Internal Server Error", None), ErrorHint::Generic);
    }
}
