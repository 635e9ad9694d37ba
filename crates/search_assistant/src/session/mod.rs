//! Answer sessions: one question, one provider call, one event channel.

mod manager;

pub use manager::{AnswerSessionManager, SessionEvents};

use llm::ProviderKind;

/// What the user asked, kept so a failed session can be resumed
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub question: String,
    pub provider_override: Option<ProviderKind>,
}
