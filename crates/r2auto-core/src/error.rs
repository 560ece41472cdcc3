use crate::conversation::ConversationError;

/// Conditions that end an agent run abnormally.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The engine session died; the run cannot continue.
    #[error("analysis engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
}
